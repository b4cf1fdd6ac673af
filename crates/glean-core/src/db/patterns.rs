//! Pattern Store operations
//!
//! The match path never scans every pattern for a tenant: candidate lookup
//! goes through the `pattern_tokens` inverted index, so per-row match cost
//! is sub-linear in the pattern count. Patterns whose body has no literal
//! tokens (rare regexes) are indexed under the wildcard token `*` and are
//! always candidates.

use regex::RegexBuilder;
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{
    EntitySignature, NewPattern, Pattern, PatternKind, PatternMatch, PatternSource, SignatureMatch,
};
use crate::text::{normalize_identifier, normalize_whitespace, tokenize};

/// Wildcard bucket for patterns with no indexable literal tokens
const WILDCARD_TOKEN: &str = "*";

/// Normalize a pattern body for uniqueness and matching
pub(crate) fn normalize_body(kind: PatternKind, body: &str) -> String {
    match kind {
        PatternKind::AccountMap => normalize_identifier(body),
        PatternKind::Substring | PatternKind::TokenBag => {
            normalize_whitespace(body).to_uppercase()
        }
        // Regex bodies are taken verbatim; signatures key on a stable joined form
        PatternKind::Regex | PatternKind::EntitySignature => normalize_whitespace(body),
    }
}

/// Literal tokens to index a pattern under
fn index_tokens(kind: PatternKind, body: &str, signature: Option<&EntitySignature>) -> Vec<String> {
    let tokens: Vec<String> = match kind {
        PatternKind::AccountMap => return Vec::new(), // matched by exact body lookup
        PatternKind::Substring | PatternKind::TokenBag => tokenize(body),
        PatternKind::Regex => {
            // Literal alphanumeric runs of length >= 3 inside the regex source
            body.split(|c: char| !c.is_alphanumeric())
                .filter(|t| t.len() >= 3)
                .map(|t| t.to_uppercase())
                .collect()
        }
        PatternKind::EntitySignature => {
            let mut out = Vec::new();
            if let Some(sig) = signature {
                for name in &sig.company_names {
                    out.extend(tokenize(name));
                }
                for kw in sig
                    .keywords
                    .iter()
                    .chain(&sig.bank_identifiers)
                    .chain(&sig.originator_hints)
                {
                    out.extend(tokenize(kw));
                }
            }
            out
        }
    };

    let mut seen = HashSet::new();
    let mut out: Vec<String> = tokens.into_iter().filter(|t| seen.insert(t.clone())).collect();
    if out.is_empty() {
        out.push(WILDCARD_TOKEN.to_string());
    }
    out
}

impl Database {
    /// Upsert a pattern, idempotent on (tenant, kind, normalized body).
    ///
    /// An existing row keeps its occurrence history; outputs, confidence,
    /// source, and active flag are refreshed from the new pattern.
    pub fn upsert_pattern(&self, tenant_id: &str, pattern: &NewPattern) -> Result<i64> {
        let conn = self.conn()?;
        let body = normalize_body(pattern.kind, &pattern.body);
        let signature_json = pattern
            .signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
            INSERT INTO patterns (
                tenant_id, kind, body, signature, entity_code, business_line_code,
                category, subcategory, confidence, source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, kind, body) DO UPDATE SET
                signature = excluded.signature,
                entity_code = excluded.entity_code,
                business_line_code = excluded.business_line_code,
                category = excluded.category,
                subcategory = excluded.subcategory,
                confidence = excluded.confidence,
                source = excluded.source,
                active = 1,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                tenant_id,
                pattern.kind.as_str(),
                body,
                signature_json,
                pattern.entity_code,
                pattern.business_line_code,
                pattern.category,
                pattern.subcategory,
                pattern.confidence,
                pattern.source.as_str(),
            ],
        )?;

        let pattern_id: i64 = conn.query_row(
            "SELECT id FROM patterns WHERE tenant_id = ? AND kind = ? AND body = ?",
            params![tenant_id, pattern.kind.as_str(), body],
            |row| row.get(0),
        )?;

        // Rebuild the token index rows for this pattern
        conn.execute(
            "DELETE FROM pattern_tokens WHERE tenant_id = ? AND pattern_id = ?",
            params![tenant_id, pattern_id],
        )?;
        for token in index_tokens(pattern.kind, &body, pattern.signature.as_ref()) {
            conn.execute(
                "INSERT OR IGNORE INTO pattern_tokens (tenant_id, token, pattern_id) VALUES (?, ?, ?)",
                params![tenant_id, token, pattern_id],
            )?;
        }

        Ok(pattern_id)
    }

    /// Get a pattern by id
    pub fn get_pattern(&self, tenant_id: &str, pattern_id: i64) -> Result<Option<Pattern>> {
        let conn = self.conn()?;
        let pattern = conn
            .query_row(
                &format!("{} WHERE p.tenant_id = ? AND p.id = ?", SELECT_PATTERN),
                params![tenant_id, pattern_id],
                Self::row_to_pattern,
            )
            .optional()?;
        Ok(pattern)
    }

    /// List patterns with optional kind/entity filters
    pub fn list_patterns(
        &self,
        tenant_id: &str,
        kind: Option<PatternKind>,
        entity_code: Option<&str>,
        include_inactive: bool,
    ) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;
        let mut sql = format!("{} WHERE p.tenant_id = ?", SELECT_PATTERN);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(k) = kind {
            sql.push_str(" AND p.kind = ?");
            params_vec.push(Box::new(k.as_str().to_string()));
        }
        if let Some(e) = entity_code {
            sql.push_str(" AND p.entity_code = ?");
            params_vec.push(Box::new(e.to_string()));
        }
        if !include_inactive {
            sql.push_str(" AND p.active = 1");
        }
        sql.push_str(" ORDER BY p.confidence DESC, p.occurrence_count DESC, p.id");

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let patterns = stmt
            .query_map(params_refs.as_slice(), Self::row_to_pattern)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(patterns)
    }

    /// Match a description against the tenant's description patterns.
    ///
    /// Returns verified matches ordered by confidence desc, then occurrence
    /// count desc, then recency.
    pub fn match_description(&self, tenant_id: &str, description: &str) -> Result<Vec<PatternMatch>> {
        let candidates = self.candidate_patterns(
            tenant_id,
            description,
            &[PatternKind::Substring, PatternKind::Regex, PatternKind::TokenBag],
        )?;

        let desc_upper = normalize_whitespace(description).to_uppercase();
        let desc_tokens: HashSet<String> = tokenize(description).into_iter().collect();

        let mut matches: Vec<(Pattern, PatternMatch)> = Vec::new();
        for pattern in candidates {
            let hit = match pattern.kind {
                PatternKind::Substring => desc_upper.contains(&pattern.body),
                PatternKind::TokenBag => tokenize(&pattern.body)
                    .iter()
                    .all(|t| desc_tokens.contains(t)),
                PatternKind::Regex => RegexBuilder::new(&pattern.body)
                    .case_insensitive(true)
                    .build()
                    .map(|re| re.is_match(description))
                    .unwrap_or(false),
                _ => false,
            };
            if hit {
                let m = PatternMatch {
                    pattern_id: pattern.id,
                    entity_code: pattern.entity_code.clone(),
                    business_line_code: pattern.business_line_code.clone(),
                    category: pattern.category.clone(),
                    subcategory: pattern.subcategory.clone(),
                    confidence: pattern.confidence,
                    occurrence_count: pattern.occurrence_count,
                };
                matches.push((pattern, m));
            }
        }

        matches.sort_by(|(pa, a), (pb, b)| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.occurrence_count.cmp(&a.occurrence_count))
                .then(pb.last_seen_at.cmp(&pa.last_seen_at))
        });

        Ok(matches.into_iter().map(|(_, m)| m).collect())
    }

    /// Look up an account-map pattern by identifier
    pub fn match_account_pattern(&self, tenant_id: &str, identifier: &str) -> Result<Option<Pattern>> {
        let conn = self.conn()?;
        let pattern = conn
            .query_row(
                &format!(
                    "{} WHERE p.tenant_id = ? AND p.kind = 'account_map' AND p.body = ? AND p.active = 1",
                    SELECT_PATTERN
                ),
                params![tenant_id, normalize_identifier(identifier)],
                Self::row_to_pattern,
            )
            .optional()?;
        Ok(pattern)
    }

    /// Score the tenant's entity signatures against a description.
    ///
    /// Token hits are weighted (company name 2, keyword 1, bank identifier 1,
    /// originator hint 1) and the total is capped at `cap`.
    pub fn match_entity_signature(
        &self,
        tenant_id: &str,
        description: &str,
        cap: i64,
    ) -> Result<Vec<SignatureMatch>> {
        let candidates =
            self.candidate_patterns(tenant_id, description, &[PatternKind::EntitySignature])?;

        let desc_upper = normalize_whitespace(description).to_uppercase();
        let desc_tokens: HashSet<String> = tokenize(description).into_iter().collect();

        let mut scored = Vec::new();
        for pattern in candidates {
            let entity_code = match &pattern.entity_code {
                Some(e) => e.clone(),
                None => continue,
            };
            let sig = match &pattern.signature {
                Some(s) => s,
                None => continue,
            };

            let mut count = 0i64;
            let mut weight = 0i64;
            for name in &sig.company_names {
                if desc_upper.contains(&normalize_whitespace(name).to_uppercase()) {
                    count += 1;
                    weight += 2;
                }
            }
            for token_list in [&sig.keywords, &sig.bank_identifiers, &sig.originator_hints] {
                for entry in token_list {
                    let hit = tokenize(entry).iter().all(|t| desc_tokens.contains(t));
                    if hit && !entry.trim().is_empty() {
                        count += 1;
                        weight += 1;
                    }
                }
            }

            if count > 0 {
                scored.push(SignatureMatch {
                    pattern_id: pattern.id,
                    entity_code,
                    match_count: count,
                    total_weight: weight.min(cap),
                });
            }
        }

        scored.sort_by(|a, b| {
            b.total_weight
                .cmp(&a.total_weight)
                .then(b.match_count.cmp(&a.match_count))
                .then(a.pattern_id.cmp(&b.pattern_id))
        });
        Ok(scored)
    }

    /// Bump a pattern's occurrence count and recency
    pub fn record_occurrence(&self, tenant_id: &str, pattern_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE patterns
            SET occurrence_count = occurrence_count + 1, last_seen_at = CURRENT_TIMESTAMP
            WHERE tenant_id = ? AND id = ?
            "#,
            params![tenant_id, pattern_id],
        )?;
        Ok(())
    }

    /// Deactivate a pattern (soft; history retained)
    pub fn deactivate_pattern(&self, tenant_id: &str, pattern_id: i64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE patterns SET active = 0, updated_at = CURRENT_TIMESTAMP WHERE tenant_id = ? AND id = ?",
            params![tenant_id, pattern_id],
        )?;
        if updated == 0 {
            return Err(crate::error::Error::NotFound(format!(
                "pattern {} for tenant {}",
                pattern_id, tenant_id
            )));
        }
        Ok(())
    }

    /// The tenant's most-applied recent patterns (context for LLM fallback)
    pub fn top_patterns(&self, tenant_id: &str, limit: i64) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            {} WHERE p.tenant_id = ? AND p.active = 1 AND p.kind != 'account_map'
            ORDER BY p.occurrence_count DESC, p.last_seen_at DESC LIMIT ?
            "#,
            SELECT_PATTERN
        ))?;
        let patterns = stmt
            .query_map(params![tenant_id, limit], Self::row_to_pattern)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(patterns)
    }

    /// Candidate patterns for a description via the inverted token index
    fn candidate_patterns(
        &self,
        tenant_id: &str,
        description: &str,
        kinds: &[PatternKind],
    ) -> Result<Vec<Pattern>> {
        let conn = self.conn()?;

        let mut tokens = tokenize(description);
        tokens.push(WILDCARD_TOKEN.to_string());

        let token_placeholders: Vec<&str> = tokens.iter().map(|_| "?").collect();
        let kind_placeholders: Vec<&str> = kinds.iter().map(|_| "?").collect();
        let sql = format!(
            r#"
            {} WHERE p.tenant_id = ? AND p.active = 1 AND p.kind IN ({})
              AND p.id IN (
                  SELECT DISTINCT pattern_id FROM pattern_tokens
                  WHERE tenant_id = ? AND token IN ({})
              )
            "#,
            SELECT_PATTERN,
            kind_placeholders.join(", "),
            token_placeholders.join(", ")
        );

        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];
        for k in kinds {
            params_vec.push(Box::new(k.as_str().to_string()));
        }
        params_vec.push(Box::new(tenant_id.to_string()));
        for t in &tokens {
            params_vec.push(Box::new(t.clone()));
        }

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let patterns = stmt
            .query_map(params_refs.as_slice(), Self::row_to_pattern)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(patterns)
    }

    /// Helper to convert a row to Pattern
    /// Column order matches SELECT_PATTERN.
    fn row_to_pattern(row: &rusqlite::Row) -> rusqlite::Result<Pattern> {
        let kind_str: String = row.get(2)?;
        let signature_json: Option<String> = row.get(4)?;
        let last_seen: Option<String> = row.get(11)?;
        let source_str: String = row.get(12)?;
        let active: i64 = row.get(13)?;
        let created_at: String = row.get(14)?;
        let updated_at: String = row.get(15)?;
        Ok(Pattern {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            kind: kind_str.parse().unwrap_or(PatternKind::Substring),
            body: row.get(3)?,
            signature: signature_json.and_then(|j| serde_json::from_str(&j).ok()),
            entity_code: row.get(5)?,
            business_line_code: row.get(6)?,
            category: row.get(7)?,
            subcategory: row.get(8)?,
            confidence: row.get(9)?,
            occurrence_count: row.get(10)?,
            last_seen_at: last_seen.map(|s| parse_datetime(&s)),
            source: source_str.parse().unwrap_or(PatternSource::Seed),
            active: active != 0,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }
}

const SELECT_PATTERN: &str = r#"
SELECT p.id, p.tenant_id, p.kind, p.body, p.signature, p.entity_code,
       p.business_line_code, p.category, p.subcategory, p.confidence,
       p.occurrence_count, p.last_seen_at, p.source, p.active,
       p.created_at, p.updated_at
FROM patterns p"#;
