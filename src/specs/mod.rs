pub mod inference;
pub mod openai;
