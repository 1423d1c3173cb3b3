//! Gemini-backed synthesis
//!
//! The handler policy becomes the system instruction; tool results are passed
//! as context in the user turn. The reply is forwarded paragraph by paragraph.

use super::{annotate_failure, summarize_tool_output, SynthesisInput, Synthesizer};
use crate::gemini::GeminiClient;
use crate::models::ToolCall;
use crate::streaming::FragmentSink;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const BASE_PROMPT: &str = r#"You are a professional financial analyst.

Guidelines:
- Ground every figure in the tool results provided; say so when data is missing
- Be structured and concise
- Emphasize research and risk awareness
- Use professional financial language

Format: markdown suitable for a chat window."#;

pub struct GeminiSynthesizer {
    client: Arc<GeminiClient>,
}

impl GeminiSynthesizer {
    pub fn new(client: Arc<GeminiClient>) -> Self {
        Self { client }
    }

    fn system_prompt(input: &SynthesisInput<'_>) -> String {
        match input.handler.policy() {
            Some(policy) => format!(
                "{}\n\nRole: {}\n\n{}",
                BASE_PROMPT,
                input.handler.role(),
                policy
            ),
            None => format!("{}\n\nRole: {}", BASE_PROMPT, input.handler.role()),
        }
    }

    fn user_prompt(input: &SynthesisInput<'_>) -> String {
        let mut prompt = format!("Question: {}\n", input.query.text.trim());

        if !input.calls.is_empty() {
            prompt.push_str("\nTool results (in call order):\n\n");
            for call in input.calls {
                if let Some(section) = summarize_tool_output(call) {
                    prompt.push_str(&section);
                }
                if let Some(note) = annotate_failure(call) {
                    prompt.push_str(&note);
                }
            }
        }

        prompt
    }
}

/// Split into paragraphs, keeping separators so the pieces concatenate back to `text`.
pub(crate) fn paragraphs(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while let Some(idx) = rest.find("\n\n") {
        let end = idx + 2;
        pieces.push(&rest[..end]);
        rest = &rest[end..];
    }

    if !rest.is_empty() {
        pieces.push(rest);
    }

    pieces
}

#[async_trait]
impl Synthesizer for GeminiSynthesizer {
    async fn synthesize(&self, input: SynthesisInput<'_>, sink: &FragmentSink) -> Result<()> {
        let system = Self::system_prompt(&input);
        let prompt = Self::user_prompt(&input);

        debug!(
            handler = input.handler.name(),
            model = self.client.model(),
            calls = input.calls.len(),
            "synthesizing with Gemini"
        );

        let text = self.client.generate(&system, &prompt).await?;

        for paragraph in paragraphs(&text) {
            sink.emit(paragraph).await?;
        }

        Ok(())
    }

    async fn supplement(
        &self,
        _input: SynthesisInput<'_>,
        late: &[ToolCall],
        sink: &FragmentSink,
    ) -> Result<()> {
        for call in late {
            if let Some(section) = summarize_tool_output(call) {
                sink.emit(format!("\n\n{}", section)).await?;
            }
        }
        Ok(())
    }
}
