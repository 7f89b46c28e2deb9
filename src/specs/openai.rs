use serde::{Deserialize, Serialize};

/// --- OPENAI-COMPATIBLE CHAT COMPLETIONS (HF ROUTER) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    System { content: String },
    User { content: String },
    Assistant { content: String },
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Text-generation-inference style token frames.
    #[serde(default)]
    pub token: Option<TgiToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgiToken {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub special: bool,
}

impl ChatChunk {
    /// Concatenated text carried by this chunk.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for choice in &self.choices {
            if let Some(c) = &choice.delta.content {
                out.push_str(c);
            }
        }
        if let Some(token) = &self.token {
            if !token.special {
                out.push_str(&token.text);
            }
        }
        out
    }
}
