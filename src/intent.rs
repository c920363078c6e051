//! Upload-intent detection.
//!
//! The relay asks an [`IntentClassifier`] whether a text message is a
//! request to push the pending archive, and if so, which repository name
//! it mentions. [`KeywordClassifier`] is the built-in, configuration
//! driven implementation.

use crate::config::IntentConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Upload { repo_name: String },
    Chat,
}

pub trait IntentClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

/// Matches upload keywords anywhere in the message.
///
/// The repository name is, in order of preference:
/// - the word after a name marker (`repo foo`, `name: foo`)
/// - the trailing identifier of the message (`upload foo`)
/// - `default_repo_name`
pub struct KeywordClassifier {
    keywords: Vec<String>,
    markers: Vec<String>,
    default_name: String,
}

impl KeywordClassifier {
    pub fn from_config(config: &IntentConfig) -> Self {
        Self {
            keywords: lowercase_all(&config.upload_keywords),
            markers: lowercase_all(&config.name_markers),
            default_name: config.default_repo_name.clone(),
        }
    }

    fn is_upload(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(k.as_str()))
    }

    fn name_after_marker(&self, text: &str) -> Option<String> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        tokens.windows(2).find_map(|pair| {
            let marker = pair[0]
                .trim_end_matches([':', '='])
                .to_lowercase();
            let is_marker = self
                .markers
                .iter()
                .any(|m| !m.is_empty() && marker.ends_with(m.as_str()));
            if !is_marker {
                return None;
            }
            let name = leading_identifier(pair[1]);
            (!name.is_empty()).then(|| name.to_string())
        })
    }

    fn trailing_name(&self, text: &str) -> Option<String> {
        let name = trailing_identifier(text.trim());
        if name.is_empty() {
            return None;
        }
        let lowered = name.to_lowercase();
        let is_keyword_or_marker = self
            .keywords
            .iter()
            .chain(self.markers.iter())
            .any(|w| *w == lowered);
        (!is_keyword_or_marker).then(|| name.to_string())
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        if !self.is_upload(&text.to_lowercase()) {
            return Intent::Chat;
        }
        let repo_name = self
            .name_after_marker(text)
            .or_else(|| self.trailing_name(text))
            .unwrap_or_else(|| self.default_name.clone());
        Intent::Upload { repo_name }
    }
}

fn lowercase_all(words: &[String]) -> Vec<String> {
    words.iter().map(|w| w.trim().to_lowercase()).collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn leading_identifier(token: &str) -> &str {
    let end = token
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

fn trailing_identifier(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> KeywordClassifier {
        KeywordClassifier::from_config(&IntentConfig::default())
    }

    fn upload(name: &str) -> Intent {
        Intent::Upload {
            repo_name: name.to_string(),
        }
    }

    #[test]
    fn plain_chat_is_not_upload() {
        assert_eq!(classifier().classify("how do lifetimes work?"), Intent::Chat);
    }

    #[test]
    fn name_follows_marker() {
        let c = classifier();
        assert_eq!(c.classify("please upload it as repo my-site now"), upload("my-site"));
        assert_eq!(c.classify("Upload with name: tools_v2."), upload("tools_v2"));
    }

    #[test]
    fn trailing_identifier_is_the_name() {
        assert_eq!(classifier().classify("upload backend-api"), upload("backend-api"));
    }

    #[test]
    fn falls_back_to_default_name() {
        let c = classifier();
        assert_eq!(c.classify("upload"), upload("my-new-project"));
        assert_eq!(c.classify("please UPLOAD!"), upload("my-new-project"));
    }

    #[test]
    fn arabic_keyword_and_marker() {
        let c = classifier();
        assert_eq!(c.classify("ارفع المشروع باسم shop"), upload("shop"));
        assert_eq!(c.classify("ارفع"), upload("my-new-project"));
    }
}
