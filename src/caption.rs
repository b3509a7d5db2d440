use crate::detector::DetectorError;
use std::{collections::HashSet, path::Path};
use tokenizers::Tokenizer;

/// Text branch of the model accepts at most this many tokens.
pub const MAX_TEXT_LEN: usize = 256;

const SPECIAL_TOKENS: [&str; 4] = ["[CLS]", "[SEP]", ".", "?"];

/// Lowercased, trimmed and terminated with a period.
pub fn normalize_caption(caption: &str) -> String {
    let caption = caption.trim().to_lowercase();
    if caption.ends_with('.') {
        caption
    } else {
        format!("{}.", caption)
    }
}

/// Token tensors for the fixed prompt, computed once and reused per request.
#[derive(Debug, Clone)]
pub struct EncodedCaption {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl EncodedCaption {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }
}

pub struct CaptionEncoder {
    tokenizer: Tokenizer,
    special_ids: HashSet<i64>,
}

impl CaptionEncoder {
    pub fn from_file(path: &Path) -> Result<Self, DetectorError> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            DetectorError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Ok(Self::new(tokenizer))
    }

    pub fn new(tokenizer: Tokenizer) -> Self {
        let special_ids = SPECIAL_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .map(i64::from)
            .collect();
        Self {
            tokenizer,
            special_ids,
        }
    }

    pub fn encode(&self, caption: &str) -> Result<EncodedCaption, DetectorError> {
        let caption = normalize_caption(caption);
        let encoding = self
            .tokenizer
            .encode(caption.as_str(), true)
            .map_err(|e| DetectorError::Tokenizer(format!("failed to encode prompt: {}", e)))?;

        let len = encoding.get_ids().len().min(MAX_TEXT_LEN);
        if len == 0 {
            return Err(DetectorError::Tokenizer(format!(
                "prompt {:?} produced no tokens",
                caption
            )));
        }

        let input_ids: Vec<i64> = encoding.get_ids()[..len]
            .iter()
            .map(|&id| id as i64)
            .collect();
        let attention_mask = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids = encoding.get_type_ids()[..len]
            .iter()
            .map(|&t| t as i64)
            .collect();

        Ok(EncodedCaption {
            input_ids,
            attention_mask,
            token_type_ids,
        })
    }

    /// Prompt token ids whose probability exceeds `text_threshold`,
    /// excluding separators and punctuation.
    pub fn phrase_token_ids(
        &self,
        token_probs: &[f32],
        caption: &EncodedCaption,
        text_threshold: f32,
    ) -> Vec<u32> {
        token_probs
            .iter()
            .zip(&caption.input_ids)
            .filter(|(prob, id)| {
                **prob > text_threshold && !self.special_ids.contains(*id)
            })
            .map(|(_, &id)| id as u32)
            .collect()
    }

    pub fn decode_phrase(&self, token_ids: &[u32]) -> Result<String, DetectorError> {
        if token_ids.is_empty() {
            return Ok(String::new());
        }
        let phrase = self
            .tokenizer
            .decode(token_ids, true)
            .map_err(|e| DetectorError::Tokenizer(format!("failed to decode phrase: {}", e)))?;
        Ok(phrase.replace('.', "").trim().to_string())
    }
}
