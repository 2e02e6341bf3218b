use thiserror::Error;

/// Separates the correlation id from the application key in comment text.
pub const SEPARATOR: char = ':';

/// A comment's text, split into who is waiting and which application signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCorrelation {
    pub correlation_id: String,
    /// `None` in global-secret mode, where the text is the bare correlation id.
    pub application_key: Option<String>,
}

impl ParsedCorrelation {
    /// The key still contains a separator, so the split point is a guess.
    pub fn has_ambiguous_key(&self) -> bool {
        self.application_key
            .as_deref()
            .is_some_and(|key| key.contains(SEPARATOR))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("text has no ':' separator")]
    MissingSeparator,
    #[error("correlation id is empty")]
    EmptyCorrelationId,
    #[error("application key is empty")]
    EmptyApplicationKey,
}

/// Parse `<correlation-id>:<application-key>`, splitting on the first separator.
///
/// Later separators stay in the key; callers can detect this with
/// [`ParsedCorrelation::has_ambiguous_key`].
pub fn parse_keyed(text: &str) -> Result<ParsedCorrelation, ParseError> {
    let (id, key) = text
        .trim()
        .split_once(SEPARATOR)
        .ok_or(ParseError::MissingSeparator)?;
    let (id, key) = (id.trim(), key.trim());
    if id.is_empty() {
        return Err(ParseError::EmptyCorrelationId);
    }
    if key.is_empty() {
        return Err(ParseError::EmptyApplicationKey);
    }
    Ok(ParsedCorrelation {
        correlation_id: id.to_string(),
        application_key: Some(key.to_string()),
    })
}

/// Parse text that is nothing but the correlation id.
pub fn parse_bare(text: &str) -> Result<ParsedCorrelation, ParseError> {
    let id = text.trim();
    if id.is_empty() {
        return Err(ParseError::EmptyCorrelationId);
    }
    Ok(ParsedCorrelation {
        correlation_id: id.to_string(),
        application_key: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_text_splits_into_id_and_key() {
        let parsed = parse_keyed("abc123:deadbeef").unwrap();
        assert_eq!(parsed.correlation_id, "abc123");
        assert_eq!(parsed.application_key.as_deref(), Some("deadbeef"));
        assert!(!parsed.has_ambiguous_key());
    }

    #[test]
    fn keyed_text_is_trimmed() {
        let parsed = parse_keyed("  abc : key1 \n").unwrap();
        assert_eq!(parsed.correlation_id, "abc");
        assert_eq!(parsed.application_key.as_deref(), Some("key1"));
    }

    #[test]
    fn missing_separator_is_malformed() {
        assert_eq!(parse_keyed("abc123"), Err(ParseError::MissingSeparator));
        assert_eq!(parse_keyed(""), Err(ParseError::MissingSeparator));
    }

    #[test]
    fn empty_pieces_are_malformed() {
        assert_eq!(parse_keyed(":key"), Err(ParseError::EmptyCorrelationId));
        assert_eq!(parse_keyed("abc:"), Err(ParseError::EmptyApplicationKey));
        assert_eq!(parse_keyed(" : "), Err(ParseError::EmptyCorrelationId));
    }

    #[test]
    fn only_first_separator_splits() {
        let parsed = parse_keyed("abc:key:extra").unwrap();
        assert_eq!(parsed.correlation_id, "abc");
        assert_eq!(parsed.application_key.as_deref(), Some("key:extra"));
        assert!(parsed.has_ambiguous_key());
    }

    #[test]
    fn bare_text_is_whole_correlation_id() {
        let parsed = parse_bare(" abc:def ").unwrap();
        assert_eq!(parsed.correlation_id, "abc:def");
        assert_eq!(parsed.application_key, None);
        assert_eq!(parse_bare("   "), Err(ParseError::EmptyCorrelationId));
    }
}
