use crate::constants::{MAX_HISTORY_MESSAGES, MAX_PROMPT_CHARS, VISION_DEFAULT_QUESTION};
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StreamRequest {
    pub mode: Mode,
    #[serde(default)]
    pub history: Vec<Message>,
    pub prompt: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VisionRequest {
    #[serde(default)]
    pub prompt: String,
    pub image_base64: String,
}

fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(RelayError::InvalidRequest("prompt cannot be empty".into()).into());
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(RelayError::InvalidRequest(format!(
            "prompt exceeds {} characters",
            MAX_PROMPT_CHARS
        ))
        .into());
    }
    Ok(())
}

impl StreamRequest {
    pub fn validate(&self) -> Result<()> {
        if self.mode.kind() != ModeKind::Text {
            return Err(RelayError::InvalidRequest(format!(
                "mode '{}' does not stream text",
                self.mode
            ))
            .into());
        }
        validate_prompt(&self.prompt)?;
        if self.history.len() > MAX_HISTORY_MESSAGES {
            return Err(RelayError::InvalidRequest(format!(
                "history exceeds limit of {} messages",
                MAX_HISTORY_MESSAGES
            ))
            .into());
        }
        Ok(())
    }
}

impl ImageRequest {
    pub fn validate(&self) -> Result<()> {
        validate_prompt(&self.prompt)
    }
}

impl VisionRequest {
    pub fn validate(&self) -> Result<()> {
        if crate::str_utils::strip_data_url(&self.image_base64).is_empty() {
            return Err(RelayError::InvalidRequest("imageBase64 cannot be empty".into()).into());
        }
        if !self.prompt.trim().is_empty() {
            validate_prompt(&self.prompt)?;
        }
        Ok(())
    }

    /// The question to ask; an empty prompt asks for a description.
    pub fn question(&self) -> &str {
        let q = self.prompt.trim();
        if q.is_empty() {
            VISION_DEFAULT_QUESTION
        } else {
            q
        }
    }

    pub fn image_payload(&self) -> &str {
        crate::str_utils::strip_data_url(&self.image_base64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_request_rejects_artifact_modes() {
        let req = StreamRequest {
            mode: Mode::Media,
            history: vec![],
            prompt: "draw".into(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn stream_request_rejects_blank_prompt() {
        let req = StreamRequest {
            mode: Mode::General,
            history: vec![],
            prompt: "   ".into(),
        };
        assert!(matches!(
            req.validate().map_err(|e| e.inner),
            Err(RelayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn vision_request_parses_camel_case_and_defaults_question() {
        let req: VisionRequest =
            serde_json::from_str(r#"{"imageBase64":"data:image/png;base64,QUJD"}"#).unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.question(), VISION_DEFAULT_QUESTION);
        assert_eq!(req.image_payload(), "QUJD");
    }
}
