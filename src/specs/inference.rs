use serde::{Deserialize, Serialize};

/// --- SERVERLESS INFERENCE PAYLOADS ---

#[derive(Debug, Clone, Serialize)]
pub struct TextToImageRequest {
    pub inputs: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VqaRequest {
    pub inputs: VqaInputs,
}

#[derive(Debug, Clone, Serialize)]
pub struct VqaInputs {
    pub image: String,
    pub question: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VqaAnswer {
    pub answer: String,
    #[serde(default)]
    pub score: f64,
}

/// Some image backends answer with JSON carrying base64 instead of raw bytes.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageJson {
    #[serde(alias = "b64_json", alias = "image_base64")]
    pub image: String,
}

/// Picks the highest-scoring answer.
pub fn top_answer(answers: &[VqaAnswer]) -> Option<&VqaAnswer> {
    answers.iter().fold(None, |best: Option<&VqaAnswer>, a| match best {
        Some(b) if b.score >= a.score => Some(b),
        _ => Some(a),
    })
}
