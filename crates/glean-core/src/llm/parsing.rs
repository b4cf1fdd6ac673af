//! JSON parsing helpers for LLM responses
//!
//! Models often wrap the JSON payload in prose; these helpers extract the
//! first balanced JSON object and deserialize it against the expected schema.

use crate::error::{Error, Result};
use crate::models::EntitySignature;
use crate::plan::ParsePlan;

use super::types::{LlmClassification, ValidationVerdict};

/// Extract the first balanced JSON object from a response
fn extract_json(response: &str) -> Result<&str> {
    let response = response.trim();
    let start = response.find('{').ok_or_else(|| {
        Error::LlmInvalidResponse(format!(
            "No JSON found in response | Raw: {}",
            truncate(response)
        ))
    })?;

    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&response[start..=start + i]);
                }
            }
            _ => {}
        }
    }

    Err(Error::LlmInvalidResponse(format!(
        "Unbalanced JSON in response | Raw: {}",
        truncate(response)
    )))
}

fn truncate(s: &str) -> String {
    if s.len() > 200 {
        format!("{}...", &s[..200])
    } else {
        s.to_string()
    }
}

/// Parse a parse plan from an analyze response
pub fn parse_plan_response(response: &str) -> Result<ParsePlan> {
    let json = extract_json(response)?;
    let plan: ParsePlan = serde_json::from_str(json)
        .map_err(|e| Error::LlmInvalidResponse(format!("Invalid plan JSON: {} | Raw: {}", e, truncate(json))))?;
    Ok(plan)
}

/// Parse a classification from a classify response
pub fn parse_classification_response(response: &str) -> Result<LlmClassification> {
    let json = extract_json(response)?;
    let mut cls: LlmClassification = serde_json::from_str(json).map_err(|e| {
        Error::LlmInvalidResponse(format!("Invalid classification JSON: {} | Raw: {}", e, truncate(json)))
    })?;
    // Empty strings mean "no value", not an entity named ""
    if cls.entity.as_deref() == Some("") {
        cls.entity = None;
    }
    if cls.business_line.as_deref() == Some("") {
        cls.business_line = None;
    }
    Ok(cls)
}

/// Parse an entity signature from an extract response
pub fn parse_signature_response(response: &str) -> Result<EntitySignature> {
    let json = extract_json(response)?;
    let sig: EntitySignature = serde_json::from_str(json).map_err(|e| {
        Error::LlmInvalidResponse(format!("Invalid signature JSON: {} | Raw: {}", e, truncate(json)))
    })?;
    if sig.is_empty() {
        return Err(Error::LlmInvalidResponse(
            "Signature extraction produced no tokens".to_string(),
        ));
    }
    Ok(sig)
}

/// Parse a validation verdict
pub fn parse_verdict_response(response: &str) -> Result<ValidationVerdict> {
    let json = extract_json(response)?;
    serde_json::from_str(json).map_err(|e| {
        Error::LlmInvalidResponse(format!("Invalid verdict JSON: {} | Raw: {}", e, truncate(json)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_with_prose() {
        let response = "Here is the result:\n{\"approved\": true, \"reason\": \"ok\"}\nDone.";
        let verdict = parse_verdict_response(response).unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.reason, "ok");
    }

    #[test]
    fn test_extract_json_nested_braces() {
        let response = r#"{"column_mapping": {"date": "Date", "amount": "Amount", "description": "Desc"}, "header_row_index": 0, "date_formats": ["%Y-%m-%d"]}"#;
        let plan = parse_plan_response(response).unwrap();
        assert_eq!(plan.header_row_index, 0);
        assert_eq!(plan.column_for("date"), Some("Date"));
    }

    #[test]
    fn test_extract_json_brace_inside_string() {
        let response = r#"{"approved": false, "reason": "body contains '}' character"}"#;
        let verdict = parse_verdict_response(response).unwrap();
        assert!(!verdict.approved);
    }

    #[test]
    fn test_classification_empty_entity_is_none() {
        let response = r#"{"entity": "", "category": "Uncategorized", "confidence": 0.2}"#;
        let cls = parse_classification_response(response).unwrap();
        assert_eq!(cls.entity, None);
    }

    #[test]
    fn test_no_json_is_invalid_response() {
        let err = parse_verdict_response("I cannot help with that").unwrap_err();
        assert!(matches!(err, Error::LlmInvalidResponse(_)));
    }

    #[test]
    fn test_empty_signature_rejected() {
        let response = r#"{"company_names": [], "keywords": []}"#;
        assert!(matches!(
            parse_signature_response(response),
            Err(Error::LlmInvalidResponse(_))
        ));
    }
}
