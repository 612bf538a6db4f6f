pub mod extraction;
pub mod gemini;
