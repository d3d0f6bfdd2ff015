use crate::error::{RagError, Result};
use crate::history::Turn;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::Serialize;

/// What the model must say when the context does not contain the answer
pub const INSUFFICIENT_CONTEXT_REPLY: &str = "I don't know based on the provided context.";

/// Returned to the user instead of a raw generation error
pub const APOLOGY_REPLY: &str =
    "Sorry, I couldn't generate an answer right now. Please try again later.";

/// Returned when the question is missing or blank
pub const EMPTY_QUESTION_REPLY: &str = "Please provide a question.";

const ANSWER_MARKER: &str = "### Answer:";

/// Pieces of answer text in the order the model produced them
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Produces answer text from a fully composed prompt
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model identifier, for logging
    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Stream the answer as it is produced.
    ///
    /// Backends that cannot stream yield the whole answer as a single piece.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let text = self.generate(prompt).await?;
        Ok(Box::pin(stream::iter(vec![Ok(text)])))
    }
}

/// Who is asking, which sets the tone of the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStyle {
    Student,
    Teacher,
    Researcher,
    #[default]
    General,
}

impl AnswerStyle {
    /// Case-insensitive; anything unrecognized is `General`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "student" => AnswerStyle::Student,
            "teacher" => AnswerStyle::Teacher,
            "researcher" => AnswerStyle::Researcher,
            _ => AnswerStyle::General,
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            AnswerStyle::Student => {
                "The reader is a student: use simple language, give examples and be encouraging."
            }
            AnswerStyle::Teacher => {
                "The reader is a teacher: explain in detail and suggest ways to teach the material."
            }
            AnswerStyle::Researcher => {
                "The reader is a researcher: be thorough, point to the passages you rely on and suggest directions for further reading."
            }
            AnswerStyle::General => "Be clear and helpful.",
        }
    }
}

/// Compose the answering prompt from retrieved context and the question.
///
/// Earlier turns of the conversation go into a `### History:` section so the
/// model can resolve follow-up questions; the answer must still come from
/// the context.
pub fn build_prompt(context: &str, question: &str, history: &[Turn], style: AnswerStyle) -> String {
    let mut prompt = format!(
        "### Instruction:\n\
         Answer the question using only the context below. \
         Do not use any outside knowledge. \
         If the context does not contain the answer, reply exactly: \"{}\"\n\
         {}\n\n",
        INSUFFICIENT_CONTEXT_REPLY,
        style.instruction()
    );

    if !history.is_empty() {
        prompt.push_str("### History:\n");
        for turn in history {
            prompt.push_str(&format!(
                "User: {}\nAssistant: {}\n",
                turn.question.trim(),
                turn.answer.trim()
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "### Context:\n{}\n\n### Question:\n{}\n\n{}\n",
        context.trim(),
        question.trim(),
        ANSWER_MARKER
    ));
    prompt
}

/// Keep only the text after the last answer marker.
///
/// Local completion models return the prompt followed by the answer; chat
/// APIs return the answer alone. Both come out the same.
pub fn extract_answer(generated: &str) -> Result<String> {
    let answer = generated
        .rsplit(ANSWER_MARKER)
        .next()
        .unwrap_or(generated)
        .trim();

    if answer.is_empty() {
        return Err(RagError::Generation("Model returned an empty answer".to_string()));
    }
    Ok(answer.to_string())
}

/// Drops a prompt that a completion model echoes ahead of its streamed answer
#[derive(Debug)]
pub struct EchoFilter<'a> {
    prompt: &'a str,
    buffer: String,
    passing: bool,
}

impl<'a> EchoFilter<'a> {
    pub fn new(prompt: &'a str) -> Self {
        EchoFilter {
            prompt,
            buffer: String::new(),
            passing: false,
        }
    }

    /// The part of `piece` that belongs to the answer, once that is known
    pub fn push(&mut self, piece: &str) -> Option<String> {
        if self.passing {
            return non_empty(piece.to_string());
        }

        self.buffer.push_str(piece);
        if self.buffer.len() < self.prompt.len() && self.prompt.starts_with(self.buffer.as_str()) {
            return None;
        }

        self.passing = true;
        let buffered = std::mem::take(&mut self.buffer);
        match buffered.strip_prefix(self.prompt) {
            Some(rest) => non_empty(rest.trim_start().to_string()),
            None => non_empty(buffered),
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
