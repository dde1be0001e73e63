use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> u64;
}

/// Whitespace-delimited word count. The default counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl TokenCounter for WhitespaceTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

/// BPE token count using the OpenAI encodings.
pub struct TiktokenTokenizer {
    encoder: Arc<CoreBPE>,
    encoding: Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    // GPT-4, GPT-3.5-turbo, text-embedding-ada-002
    Cl100k,
    // GPT-4o models
    O200k,
}

impl TiktokenTokenizer {
    pub fn new(encoding: Encoding) -> Result<Self> {
        let encoder = match encoding {
            Encoding::Cl100k => cl100k_base()?,
            Encoding::O200k => o200k_base()?,
        };

        Ok(Self {
            encoder: Arc::new(encoder),
            encoding,
        })
    }

    /// Picks the encoding from a model name, defaulting to cl100k.
    pub fn for_model(model: &str) -> Result<Self> {
        if model.contains("gpt-4o") {
            Self::new(Encoding::O200k)
        } else {
            Self::new(Encoding::Cl100k)
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl TokenCounter for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> u64 {
        // Raw content only: chat-format markers and role tokens added by the
        // server are not counted.
        self.encoder.encode_with_special_tokens(text).len() as u64
    }
}

/// Token counter selection as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    #[default]
    Whitespace,
    Cl100k,
    O200k,
}

impl TokenizerKind {
    pub fn build(self) -> Result<Arc<dyn TokenCounter>> {
        Ok(match self {
            TokenizerKind::Whitespace => Arc::new(WhitespaceTokenizer),
            TokenizerKind::Cl100k => Arc::new(TiktokenTokenizer::new(Encoding::Cl100k)?),
            TokenizerKind::O200k => Arc::new(TiktokenTokenizer::new(Encoding::O200k)?),
        })
    }
}
