use std::time::Duration;

/// Hugging Face router (OpenAI-compatible chat completions)
pub const DEFAULT_CHAT_URL: &str = "https://router.huggingface.co/v1/chat/completions";
/// Hugging Face serverless inference, one endpoint per model id
pub const DEFAULT_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// Backing models
pub const DEFAULT_CHAT_MODEL: &str = "meta-llama/Llama-3.1-8B-Instruct";
pub const DEFAULT_IMAGE_MODEL: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_VISION_MODEL: &str = "dandelin/vilt-b32-finetuned-vqa";

pub const API_TOKEN_ENV: &str = "HF_TOKEN";

pub const GENERAL_SYSTEM_PROMPT: &str = "You are a friendly, helpful assistant. Answer clearly and concisely, and format your replies with Markdown when it helps readability.";
pub const CODING_SYSTEM_PROMPT: &str = "You are an expert programming assistant. Explain your reasoning briefly, put all code in fenced code blocks tagged with the language, and point out pitfalls or edge cases.";

pub const CHAT_MAX_TOKENS: u32 = 1024;
pub const CHAT_TEMPERATURE: f32 = 0.7;

/// Used when the vision model ranks no answers.
pub const VISION_FALLBACK_ANSWER: &str = "Sorry, I couldn't find an answer to that question in the image.";
pub const VISION_DEFAULT_QUESTION: &str = "What is in this image?";

/// Ingress limits
pub const MAX_HISTORY_MESSAGES: usize = 200;
pub const MAX_PROMPT_CHARS: usize = 32_000;

/// Stream relay
pub const MAX_STREAM_LINE_BYTES: usize = 1024 * 1024;
pub const RELAY_CHANNEL_CAPACITY: usize = 64;
pub const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

/// Retry policy defaults
pub const MAX_RETRIES: u32 = 2;
pub const RETRY_FLOOR: Duration = Duration::from_secs(20);
/// Upper bound on any upstream-supplied wait estimate.
pub const MAX_ESTIMATED_WAIT: Duration = Duration::from_secs(3600);

/// Deadlines per request kind; artifact models cold-start slower.
pub const TEXT_TIMEOUT: Duration = Duration::from_secs(90);
pub const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(180);

/// Wakeup polling
pub const WAKEUP_POLL_FLOOR: Duration = Duration::from_secs(5);
pub const WAKEUP_MAX_POLLS: u32 = 12;

pub const PLACEHOLDER_ROTATION_INTERVAL: Duration = Duration::from_secs(3);

pub const IMAGE_PROGRESS_MESSAGES: &[&str] = &[
    "Warming up the image model...",
    "Sketching the composition...",
    "Mixing the colors...",
    "Adding the fine details...",
    "Almost there, polishing the result...",
];

pub const VISION_PROGRESS_MESSAGES: &[&str] = &[
    "Looking at your image...",
    "Studying the details...",
    "Thinking about your question...",
    "Putting the answer together...",
];

pub const TIMEOUT_APOLOGY: &str = "Sorry, the model took too long to respond. Please try again in a moment.";

/// Local key-value storage
pub const TODO_STORAGE_KEY: &str = "chatbot-todos";
