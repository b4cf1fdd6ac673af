//! Data models for Glean
//!
//! Every persisted entity carries a tenant id; nothing in the core ever
//! dereferences a cross-tenant reference.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed storage scale for transaction amounts.
pub const AMOUNT_SCALE: u32 = 8;

/// A tenant (one customer organization)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    pub industry: Option<String>,
    pub default_currency: String,
    pub fiscal_year_end: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A legal entity within a tenant's chart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalEntity {
    pub tenant_id: String,
    pub code: String,
    pub display_name: String,
    pub legal_name: Option<String>,
    pub entity_type: Option<String>,
    pub base_currency: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A business line (profit center) owned by a legal entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessLine {
    pub tenant_id: String,
    pub entity_code: String,
    pub code: String,
    pub name: String,
    pub is_default: bool,
    pub color: Option<String>,
    pub active: bool,
}

/// Kind of real-world funding source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Bank,
    Wallet,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bank => "bank",
            Self::Wallet => "wallet",
        }
    }
}

impl std::str::FromStr for AccountKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bank" => Ok(Self::Bank),
            "wallet" => Ok(Self::Wallet),
            _ => Err(format!("Unknown account kind: {}", s)),
        }
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A known funding source (bank account or crypto wallet)
///
/// The classifier short-circuits on these: a row whose origin, destination,
/// or account identifier matches inherits the mapped entity and line at
/// confidence 0.99.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub tenant_id: String,
    pub kind: AccountKind,
    /// Identifier as entered (masked number suffix or wallet address)
    pub identifier: String,
    pub display_name: Option<String>,
    pub entity_code: String,
    pub business_line_code: Option<String>,
    pub default_category: Option<String>,
    pub default_subcategory: Option<String>,
    /// Role tag, e.g. "mining" for receiving wallets
    pub role: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an uploaded raw file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawFileStatus {
    Received,
    Analyzed,
    Ingested,
    PartiallyIngested,
    Failed,
}

impl RawFileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Analyzed => "analyzed",
            Self::Ingested => "ingested",
            Self::PartiallyIngested => "partially_ingested",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RawFileStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "received" => Ok(Self::Received),
            "analyzed" => Ok(Self::Analyzed),
            "ingested" => Ok(Self::Ingested),
            "partially_ingested" => Ok(Self::PartiallyIngested),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown raw file status: {}", s)),
        }
    }
}

impl std::fmt::Display for RawFileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One physical upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFile {
    pub id: i64,
    pub tenant_id: String,
    pub filename: String,
    pub blob_ref: String,
    /// Whole-file hash, used for whole-file dedupe
    pub content_hash: String,
    pub size_bytes: i64,
    pub status: RawFileStatus,
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a classification was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    AccountMap,
    TenantPattern,
    Llm,
    #[default]
    Default,
    User,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountMap => "account_map",
            Self::TenantPattern => "tenant_pattern",
            Self::Llm => "llm",
            Self::Default => "default",
            Self::User => "user",
        }
    }
}

impl std::str::FromStr for ClassificationSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "account_map" => Ok(Self::AccountMap),
            "tenant_pattern" => Ok(Self::TenantPattern),
            "llm" => Ok(Self::Llm),
            "default" => Ok(Self::Default),
            "user" => Ok(Self::User),
            _ => Err(format!("Unknown classification source: {}", s)),
        }
    }
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized transaction shape produced by the ingestion engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub tenant_id: String,
    pub raw_file_id: i64,
    pub row_index_in_file: i64,
    pub posted_date: NaiveDate,
    pub description: String,
    /// Positive = money in, negative = money out, relative to the owning account
    pub amount: Decimal,
    pub currency: String,
    pub account_identifier: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub reference: Option<String>,
    pub transaction_type: Option<String>,
    pub network: Option<String>,
    pub content_hash: String,
}

impl CanonicalRow {
    /// Stable hash of the identifying fields, scoped to the tenant.
    ///
    /// Governs row-level dedupe: re-ingesting the same row is idempotent on
    /// (tenant_id, content_hash). The amount is normalized to the fixed
    /// storage scale first so byte-identical inputs always hash alike.
    pub fn compute_content_hash(
        tenant_id: &str,
        posted_date: &NaiveDate,
        description: &str,
        amount: &Decimal,
        currency: &str,
        account_identifier: Option<&str>,
        reference: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(posted_date.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(description.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(amount.round_dp(AMOUNT_SCALE).normalize().to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(currency.as_bytes());
        hasher.update(b"\x1f");
        if let Some(acct) = account_identifier {
            hasher.update(acct.as_bytes());
        }
        hasher.update(b"\x1f");
        if let Some(r) = reference {
            hasher.update(r.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Classification assigned to a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub accounting_category: String,
    pub subcategory: String,
    pub justification: String,
    /// In [0, 1]
    pub confidence: f64,
    pub source: ClassificationSource,
}

impl Classification {
    /// The unclassified default: Uncategorized at zero confidence.
    pub fn unclassified() -> Self {
        Self {
            entity_code: None,
            business_line_code: None,
            accounting_category: "Uncategorized".to_string(),
            subcategory: String::new(),
            justification: String::new(),
            confidence: 0.0,
            source: ClassificationSource::Default,
        }
    }
}

/// A stored transaction (CanonicalRow plus classification state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub tenant_id: String,
    pub raw_file_id: i64,
    pub row_index_in_file: i64,
    pub posted_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    pub account_identifier: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub reference: Option<String>,
    pub transaction_type: Option<String>,
    pub network: Option<String>,
    pub content_hash: String,
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub accounting_category: Option<String>,
    pub subcategory: Option<String>,
    pub justification: Option<String>,
    pub confidence: f64,
    pub classification_source: ClassificationSource,
    pub needs_review: bool,
    pub archived: bool,
    /// Friendly names resolved from the account table at classification time
    pub origin_display: Option<String>,
    pub destination_display: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Kind of a stored pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Match on a known account identifier or wallet address
    AccountMap,
    /// Case-insensitive substring of the description
    Substring,
    /// Regular expression over the description
    Regex,
    /// All tokens must appear in the description (any order)
    TokenBag,
    /// LLM-extracted token-set fingerprint for an entity
    EntitySignature,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountMap => "account_map",
            Self::Substring => "substring",
            Self::Regex => "regex",
            Self::TokenBag => "token_bag",
            Self::EntitySignature => "entity_signature",
        }
    }
}

impl std::str::FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "account_map" => Ok(Self::AccountMap),
            "substring" => Ok(Self::Substring),
            "regex" => Ok(Self::Regex),
            "token_bag" => Ok(Self::TokenBag),
            "entity_signature" => Ok(Self::EntitySignature),
            _ => Err(format!("Unknown pattern kind: {}", s)),
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a pattern came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    Seed,
    UserCorrection,
    LlmExtraction,
}

impl PatternSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::UserCorrection => "user_correction",
            Self::LlmExtraction => "llm_extraction",
        }
    }
}

impl std::str::FromStr for PatternSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "seed" => Ok(Self::Seed),
            "user_correction" => Ok(Self::UserCorrection),
            "llm_extraction" => Ok(Self::LlmExtraction),
            _ => Err(format!("Unknown pattern source: {}", s)),
        }
    }
}

impl std::fmt::Display for PatternSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Token-set fingerprint associating descriptions with an entity
///
/// Matches are additive: each token hit contributes its weight
/// (company name 2, everything else 1), capped at the tenant ceiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySignature {
    #[serde(default)]
    pub company_names: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub bank_identifiers: Vec<String>,
    #[serde(default)]
    pub originator_hints: Vec<String>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
}

impl EntitySignature {
    pub fn is_empty(&self) -> bool {
        self.company_names.is_empty()
            && self.keywords.is_empty()
            && self.bank_identifiers.is_empty()
            && self.originator_hints.is_empty()
    }
}

/// A classification rule in the Pattern Store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: i64,
    pub tenant_id: String,
    pub kind: PatternKind,
    /// Normalized rule body (substring/regex/token list/identifier)
    pub body: String,
    /// Structured body for entity signatures
    pub signature: Option<EntitySignature>,
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub confidence: f64,
    pub occurrence_count: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub source: PatternSource,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new pattern to be upserted
#[derive(Debug, Clone)]
pub struct NewPattern {
    pub kind: PatternKind,
    pub body: String,
    pub signature: Option<EntitySignature>,
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub confidence: f64,
    pub source: PatternSource,
}

/// A description-pattern match returned by the Pattern Store
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern_id: i64,
    pub entity_code: Option<String>,
    pub business_line_code: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub confidence: f64,
    pub occurrence_count: i64,
}

/// A scored entity-signature candidate
#[derive(Debug, Clone)]
pub struct SignatureMatch {
    pub pattern_id: i64,
    pub entity_code: String,
    pub match_count: i64,
    /// Weighted token hits, capped at the tenant ceiling
    pub total_weight: i64,
}

/// One user edit of a classification field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: i64,
    pub tenant_id: String,
    pub transaction_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub user_id: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a candidate pattern proposed by the reinforcement engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    ValidatedPassOne,
    ValidatedPassTwo,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ValidatedPassOne => "validated_pass_one",
            Self::ValidatedPassTwo => "validated_pass_two",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

impl std::str::FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "validated_pass_one" => Ok(Self::ValidatedPassOne),
            "validated_pass_two" => Ok(Self::ValidatedPassTwo),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown suggestion status: {}", s)),
        }
    }
}

impl std::fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recurrence class of the transactions behind a suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyClass {
    Daily,
    Weekly,
    Monthly,
    Irregular,
}

impl FrequencyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Irregular => "irregular",
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Irregular)
    }
}

impl std::str::FromStr for FrequencyClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "irregular" => Ok(Self::Irregular),
            _ => Err(format!("Unknown frequency class: {}", s)),
        }
    }
}

impl std::fmt::Display for FrequencyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A candidate pattern awaiting two-pass validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSuggestion {
    pub id: i64,
    pub tenant_id: String,
    pub status: SuggestionStatus,
    pub kind: PatternKind,
    pub body: String,
    pub signature: Option<EntitySignature>,
    pub entity_code: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    /// How many stored transactions the candidate currently matches
    pub occurrence_count: i64,
    pub first_seen: Option<NaiveDate>,
    pub last_seen: Option<NaiveDate>,
    pub frequency_class: Option<FrequencyClass>,
    /// Coefficient of variation of matched amounts
    pub amount_cv: Option<f64>,
    /// Manual classifications targeting the same value
    pub correction_count: i64,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Statistics gathered for Pass 2 validation
#[derive(Debug, Clone)]
pub struct SuggestionStats {
    pub occurrence_count: i64,
    pub first_seen: Option<NaiveDate>,
    pub last_seen: Option<NaiveDate>,
    pub frequency_class: FrequencyClass,
    pub amount_cv: Option<f64>,
    pub correction_count: i64,
}

/// A persisted security-category event
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub id: i64,
    pub tenant_id: Option<String>,
    pub category: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Diagnostics for one rejected source row
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRow {
    pub id: i64,
    pub tenant_id: String,
    pub job_id: i64,
    pub row_index_in_file: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
