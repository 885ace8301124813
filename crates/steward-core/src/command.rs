//! Current command surface: signed one-shot command tokens, the
//! two-phase fetch-and-execute pipeline, and the liveness probe.
//!
//! A command arrives as a query parameter carrying five dot-delimited
//! fields. The pipeline verifies the named signing key over the fields
//! exactly as transmitted, gates on the requesting principal, renders a
//! confirmation page on GET, and on a confirmed POST burns the token's
//! nonce, fetches the payload over the agent's own HTTP client, and
//! hands it to the execution collaborator. Every outcome is a typed
//! disposition; the host adapter decides the final rendering.
//!
//! The probe is a lighter cousin: a three-field expiring token answered
//! with a fixed PNG. It proves the agent is reachable and its clock and
//! keys are sane, without touching pairing or nonce state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use steward_crypto::verify::verify_detached;
use steward_fetch::FetchClient;

use crate::errors::{AuthError, CoreError};
use crate::store::{NonceOutcome, StateStore};
use crate::trust::KeyRing;
use crate::types::unix_now;

/// 11x7 single-color white PNG returned to a valid liveness probe.
pub const PROBE_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
    0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x0b, 0x00, 0x00, 0x00, 0x07,
    0x08, 0x03, 0x00, 0x00, 0x00, 0xe9, 0xb0, 0x47, 0x6f, 0x00, 0x00, 0x00,
    0x03, 0x50, 0x4c, 0x54, 0x45, 0xff, 0xff, 0xff, 0xa7, 0xc4, 0x1b, 0xc8,
    0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x01, 0x63, 0xa0,
    0x01, 0x00, 0x00, 0x00, 0x54, 0x00, 0x01, 0xb2, 0x6c, 0x01, 0x69, 0x00,
    0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

// ============================================================================
// Token Parsing
// ============================================================================

/// Failure to read a dot-delimited token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Wrong number of dot-delimited fields
    #[error("token does not have the expected field count")]
    WrongShape,

    /// A field failed base64url or text decoding
    #[error("token field {0:?} could not be decoded")]
    BadField(&'static str),
}

/// Parsed five-field command token.
///
/// Wire form: `keyName.payloadB64.nonce.labelB64.signatureB64`, with the
/// encoded fields in unpadded base64url. The signature covers the first
/// four fields dot-joined exactly as transmitted.
#[derive(Debug, Clone)]
pub struct CommandToken {
    pub key_name: String,
    /// Decoded payload URL, possibly carrying a `#fragment` of params
    pub command_url: String,
    pub nonce: String,
    /// Decoded human-readable controller label for the confirmation page
    pub label: String,
    pub signature: Vec<u8>,
    /// The signed bytes, kept as transmitted
    pub signed_portion: String,
}

impl CommandToken {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let fields: Vec<&str> = raw.split('.').collect();
        if fields.len() != 5 {
            return Err(TokenError::WrongShape);
        }
        // Dots cannot occur inside unpadded base64url, so joining the
        // transmitted fields reconstructs the signed bytes exactly.
        let signed_portion = fields[..4].join(".");

        let command_url = decode_text_field(fields[1], "command url")?;
        let nonce = fields[2];
        if nonce.is_empty() {
            return Err(TokenError::BadField("nonce"));
        }
        let label = decode_text_field(fields[3], "label")?;
        let signature = URL_SAFE_NO_PAD
            .decode(fields[4])
            .map_err(|_| TokenError::BadField("signature"))?;

        Ok(Self {
            key_name: fields[0].to_string(),
            command_url,
            nonce: nonce.to_string(),
            label,
            signature,
            signed_portion,
        })
    }
}

/// Parsed three-field probe token: `keyName.expiresAt.signatureB64`.
#[derive(Debug, Clone)]
pub struct ProbeToken {
    pub key_name: String,
    /// Unix seconds; the token is dead once this moment has passed
    pub expires_at: u64,
    pub signature: Vec<u8>,
    pub signed_portion: String,
}

impl ProbeToken {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let fields: Vec<&str> = raw.split('.').collect();
        if fields.len() != 3 {
            return Err(TokenError::WrongShape);
        }
        let signed_portion = fields[..2].join(".");
        let expires_at: u64 = fields[1]
            .parse()
            .map_err(|_| TokenError::BadField("expiry"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(fields[2])
            .map_err(|_| TokenError::BadField("signature"))?;

        Ok(Self {
            key_name: fields[0].to_string(),
            expires_at,
            signature,
            signed_portion,
        })
    }
}

fn decode_text_field(field: &str, name: &'static str) -> Result<String, TokenError> {
    let raw = URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|_| TokenError::BadField(name))?;
    String::from_utf8(raw).map_err(|_| TokenError::BadField(name))
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Identity of the requesting principal, supplied per request by the
/// host adapter. The pipeline never inspects host sessions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalContext {
    Anonymous,
    Authenticated {
        /// Whether the principal holds the host's manage capability
        can_manage: bool,
    },
}

/// Everything an executor learns about the command being run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Payload URL with the fragment stripped
    pub command_url: String,
    /// Parameters parsed from the URL fragment
    pub params: HashMap<String, String>,
    /// The consumed one-shot nonce
    pub nonce: String,
}

/// Outcome of a payload run, rendered by the host adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Runs a fetched payload. The pipeline grants nothing else: an
/// implementation sees the payload bytes and the execution context, and
/// decides for itself how much host access to extend.
#[async_trait]
pub trait PayloadExecutor: Send + Sync {
    async fn execute(
        &self,
        payload: &[u8],
        context: &ExecutionContext,
    ) -> Result<ExecutionReport, CoreError>;
}

/// Issues and checks the anti-forgery tokens embedded in confirmation
/// pages. Tokens are scoped; a token issued for one command URL must not
/// verify for another.
#[async_trait]
pub trait FormTokenService: Send + Sync {
    async fn issue(&self, scope: &str) -> Result<String, CoreError>;
    async fn verify(&self, scope: &str, token: &str) -> Result<bool, CoreError>;
}

// ============================================================================
// Dispositions
// ============================================================================

/// What the host adapter should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDisposition {
    /// Not our traffic; the host continues its own request handling
    NotForUs,
    /// Refuse with a wire-safe message
    ErrorPage { message: String },
    /// Send the anonymous principal to the host login, returning here
    LoginRedirect { return_to: String },
    /// Render the confirmation prompt
    Confirm(ConfirmationPage),
    /// Answer with the probe image bytes
    ProbeImage(&'static [u8]),
    /// Payload ran; render the report
    Executed(ExecutionReport),
}

/// Contents of the confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPage {
    /// Decoded controller label shown to the operator
    pub label: String,
    /// URL the confirmation form posts back to
    pub form_action: String,
    /// Anti-forgery token to embed as a hidden field
    pub form_token: String,
}

// ============================================================================
// Command Pipeline
// ============================================================================

/// Verifies, confirms, fetches, and executes signed one-shot commands.
pub struct CommandPipeline {
    keyring: KeyRing,
    store: Arc<dyn StateStore>,
    fetcher: FetchClient,
    executor: Arc<dyn PayloadExecutor>,
    form_tokens: Arc<dyn FormTokenService>,
}

impl CommandPipeline {
    pub fn new(
        keyring: KeyRing,
        store: Arc<dyn StateStore>,
        fetcher: FetchClient,
        executor: Arc<dyn PayloadExecutor>,
        form_tokens: Arc<dyn FormTokenService>,
    ) -> Self {
        Self {
            keyring,
            store,
            fetcher,
            executor,
            form_tokens,
        }
    }

    /// First phase: verify the token and render the confirmation prompt.
    ///
    /// Nothing is consumed or fetched here; a GET can be repeated freely.
    pub async fn handle_get(
        &self,
        raw: &str,
        principal: PrincipalContext,
        request_url: &str,
    ) -> Result<CommandDisposition, CoreError> {
        let token = match self.check_token(raw) {
            Ok(token) => token,
            Err(disposition) => return Ok(disposition),
        };
        if let Some(disposition) = gate(principal, request_url) {
            return Ok(disposition);
        }
        let form_token = self
            .form_tokens
            .issue(&confirm_scope(&token.command_url))
            .await?;
        debug!(key = %token.key_name, "command confirmation rendered");
        Ok(CommandDisposition::Confirm(ConfirmationPage {
            label: token.label,
            form_action: request_url.to_string(),
            form_token,
        }))
    }

    /// Second phase: a confirmed POST. Burns the nonce, fetches the
    /// payload, and runs it.
    ///
    /// Order matters: the anti-forgery token is checked first (it is the
    /// cheap, replayable check), then the nonce is consumed (the
    /// load-bearing replay defense), and only then does the agent reach
    /// out to the network.
    pub async fn handle_post(
        &self,
        raw: &str,
        principal: PrincipalContext,
        request_url: &str,
        form_token: &str,
    ) -> Result<CommandDisposition, CoreError> {
        let token = match self.check_token(raw) {
            Ok(token) => token,
            Err(disposition) => return Ok(disposition),
        };
        if let Some(disposition) = gate(principal, request_url) {
            return Ok(disposition);
        }

        if !self
            .form_tokens
            .verify(&confirm_scope(&token.command_url), form_token)
            .await?
        {
            debug!("confirmation token rejected");
            return Ok(CommandDisposition::ErrorPage {
                message: "invalid confirmation token, please retry".to_string(),
            });
        }

        match self.store.consume_nonce(&token.nonce, unix_now()).await? {
            NonceOutcome::Fresh => {}
            NonceOutcome::AlreadyUsed => {
                warn!(nonce = %token.nonce, "command nonce already consumed");
                return Ok(error_page(&AuthError::NonceAlreadyUsed.into()));
            }
        }

        let (fetch_url, params) = split_fragment(&token.command_url);
        let payload = match self.fetcher.get(&fetch_url).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(url = %fetch_url, error = %err, "payload fetch failed");
                return Ok(error_page(&CoreError::Fetch(err)));
            }
        };

        let context = ExecutionContext {
            command_url: fetch_url,
            params,
            nonce: token.nonce,
        };
        let report = match self.executor.execute(&payload, &context).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "payload execution failed");
                return Ok(error_page(&err));
            }
        };
        info!(summary = %report.summary, "command payload executed");
        Ok(CommandDisposition::Executed(report))
    }

    /// Answer a liveness probe. Every failure is a silent ignore; the
    /// probe must not leak whether the agent is present.
    pub fn handle_probe(&self, raw: &str) -> CommandDisposition {
        self.probe_at(raw, unix_now())
    }

    fn probe_at(&self, raw: &str, now: u64) -> CommandDisposition {
        let token = match ProbeToken::parse(raw) {
            Ok(token) => token,
            Err(_) => return CommandDisposition::NotForUs,
        };
        if token.expires_at < now {
            return CommandDisposition::NotForUs;
        }
        let Some(entry) = self.keyring.resolve_live(&token.key_name, now) else {
            return CommandDisposition::NotForUs;
        };
        if !verify_detached(&entry.key, token.signed_portion.as_bytes(), &token.signature) {
            return CommandDisposition::NotForUs;
        }
        debug!(key = %token.key_name, "liveness probe answered");
        CommandDisposition::ProbeImage(PROBE_PNG)
    }

    /// Shared front half of both phases: parse, resolve the key, verify
    /// the signature. `Err` carries the disposition to return; no state
    /// is mutated on any failure path.
    fn check_token(&self, raw: &str) -> Result<CommandToken, CommandDisposition> {
        let token = match CommandToken::parse(raw) {
            Ok(token) => token,
            Err(TokenError::WrongShape) => return Err(CommandDisposition::NotForUs),
            Err(err) => {
                debug!(error = %err, "command token rejected");
                return Err(error_page(&CoreError::BadRequest(err.to_string())));
            }
        };
        let Some(entry) = self.keyring.resolve_live(&token.key_name, unix_now()) else {
            warn!(key = %token.key_name, "command token names no live signing key");
            return Err(error_page(&AuthError::UnknownKey(token.key_name.clone()).into()));
        };
        if !verify_detached(&entry.key, token.signed_portion.as_bytes(), &token.signature) {
            warn!(key = %token.key_name, "command token failed signature verification");
            return Err(error_page(&AuthError::BadSignature.into()));
        }
        Ok(token)
    }
}

fn gate(principal: PrincipalContext, request_url: &str) -> Option<CommandDisposition> {
    match principal {
        PrincipalContext::Anonymous => Some(CommandDisposition::LoginRedirect {
            return_to: request_url.to_string(),
        }),
        PrincipalContext::Authenticated { can_manage: false } => {
            Some(error_page(&AuthError::Unauthorized.into()))
        }
        PrincipalContext::Authenticated { can_manage: true } => None,
    }
}

fn error_page(err: &CoreError) -> CommandDisposition {
    CommandDisposition::ErrorPage {
        message: err.public_message(),
    }
}

/// Anti-forgery scope for the confirmation form, bound to the decoded
/// command URL as a whole, fragment included. A token issued to confirm
/// one command cannot confirm another.
fn confirm_scope(command_url: &str) -> String {
    format!("run-{command_url}")
}

/// Split the decoded command URL at its `#fragment` and parse the
/// fragment as a query string of execution parameters.
fn split_fragment(command_url: &str) -> (String, HashMap<String, String>) {
    match command_url.split_once('#') {
        Some((bare, fragment)) => {
            let params = url::form_urlencoded::parse(fragment.as_bytes())
                .into_owned()
                .collect();
            (bare.to_string(), params)
        }
        None => (command_url.to_string(), HashMap::new()),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::trust::SigningKeyEntry;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;
    use std::sync::Mutex;
    use steward_fetch::FetchConfig;

    fn make_command_token(
        signer: &SigningKey,
        key_name: &str,
        command_url: &str,
        nonce: &str,
        label: &str,
    ) -> String {
        let payload = URL_SAFE_NO_PAD.encode(command_url);
        let pair = URL_SAFE_NO_PAD.encode(label);
        let signed = format!("{key_name}.{payload}.{nonce}.{pair}");
        let sig = URL_SAFE_NO_PAD.encode(signer.sign(signed.as_bytes()).to_bytes());
        format!("{signed}.{sig}")
    }

    fn make_probe_token(signer: &SigningKey, key_name: &str, expires_at: u64) -> String {
        let signed = format!("{key_name}.{expires_at}");
        let sig = URL_SAFE_NO_PAD.encode(signer.sign(signed.as_bytes()).to_bytes());
        format!("{signed}.{sig}")
    }

    struct StaticTokens {
        accept: bool,
        scopes: Mutex<Vec<String>>,
    }

    impl StaticTokens {
        fn accepting() -> Arc<Self> {
            Arc::new(Self {
                accept: true,
                scopes: Mutex::new(Vec::new()),
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                accept: false,
                scopes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FormTokenService for StaticTokens {
        async fn issue(&self, scope: &str) -> Result<String, CoreError> {
            self.scopes.lock().unwrap().push(scope.to_string());
            Ok(format!("token-for-{scope}"))
        }

        async fn verify(&self, scope: &str, _token: &str) -> Result<bool, CoreError> {
            self.scopes.lock().unwrap().push(scope.to_string());
            Ok(self.accept)
        }
    }

    struct RecordingExecutor {
        calls: Mutex<Vec<(Vec<u8>, ExecutionContext)>>,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PayloadExecutor for RecordingExecutor {
        async fn execute(
            &self,
            payload: &[u8],
            context: &ExecutionContext,
        ) -> Result<ExecutionReport, CoreError> {
            self.calls
                .lock()
                .unwrap()
                .push((payload.to_vec(), context.clone()));
            Ok(ExecutionReport {
                summary: "ran".to_string(),
                output: None,
            })
        }
    }

    fn make_pipeline(
        signer: &SigningKey,
        form_tokens: Arc<StaticTokens>,
    ) -> (CommandPipeline, Arc<InMemoryStore>, Arc<RecordingExecutor>) {
        let ring = KeyRing::new(vec![SigningKeyEntry {
            name: "primary".to_string(),
            key: signer.verifying_key(),
            expires_at: None,
        }])
        .unwrap();
        let store = InMemoryStore::new_shared();
        let executor = RecordingExecutor::new();
        let pipeline = CommandPipeline::new(
            ring,
            store.clone(),
            FetchClient::new(FetchConfig::default()).unwrap(),
            executor.clone(),
            form_tokens,
        );
        (pipeline, store, executor)
    }

    // ------------------------------------------------------------------
    // Token parsing
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_command_token() {
        let signer = SigningKey::generate(&mut OsRng);
        let raw = make_command_token(&signer, "primary", "https://payloads.test/c", "n-1", "Controller");
        let token = CommandToken::parse(&raw).unwrap();

        assert_eq!(token.key_name, "primary");
        assert_eq!(token.command_url, "https://payloads.test/c");
        assert_eq!(token.nonce, "n-1");
        assert_eq!(token.label, "Controller");
        assert_eq!(token.signature.len(), 64);
        assert!(raw.starts_with(&token.signed_portion));
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert_eq!(CommandToken::parse("").unwrap_err(), TokenError::WrongShape);
        assert_eq!(CommandToken::parse("a.b.c.d").unwrap_err(), TokenError::WrongShape);
        assert_eq!(
            CommandToken::parse("a.b.c.d.e.f").unwrap_err(),
            TokenError::WrongShape
        );
    }

    #[test]
    fn test_parse_rejects_bad_payload_encoding() {
        let result = CommandToken::parse("key.!!bad!!.nonce.bGFiZWw.c2ln");
        assert_eq!(result.unwrap_err(), TokenError::BadField("command url"));
    }

    #[test]
    fn test_parse_rejects_non_utf8_label() {
        let label = URL_SAFE_NO_PAD.encode([0xff, 0xfe]);
        let raw = format!("key.dXJs.nonce.{label}.c2ln");
        assert_eq!(
            CommandToken::parse(&raw).unwrap_err(),
            TokenError::BadField("label")
        );
    }

    #[test]
    fn test_parse_rejects_empty_nonce() {
        let result = CommandToken::parse("key.dXJs..bGFiZWw.c2ln");
        assert_eq!(result.unwrap_err(), TokenError::BadField("nonce"));
    }

    #[test]
    fn test_parse_probe_token() {
        let signer = SigningKey::generate(&mut OsRng);
        let raw = make_probe_token(&signer, "primary", 1_900_000_000);
        let token = ProbeToken::parse(&raw).unwrap();

        assert_eq!(token.key_name, "primary");
        assert_eq!(token.expires_at, 1_900_000_000);
        assert_eq!(token.signed_portion, "primary.1900000000");
    }

    #[test]
    fn test_parse_probe_rejects_non_decimal_expiry() {
        assert_eq!(
            ProbeToken::parse("key.soon.c2ln").unwrap_err(),
            TokenError::BadField("expiry")
        );
        assert_eq!(
            ProbeToken::parse("key.-5.c2ln").unwrap_err(),
            TokenError::BadField("expiry")
        );
    }

    // ------------------------------------------------------------------
    // Fragment splitting
    // ------------------------------------------------------------------

    #[test]
    fn test_split_fragment_absent() {
        let (url, params) = split_fragment("https://payloads.test/c");
        assert_eq!(url, "https://payloads.test/c");
        assert!(params.is_empty());
    }

    #[test]
    fn test_split_fragment_parses_params() {
        let (url, params) = split_fragment("https://payloads.test/c#mode=full&retry=1");
        assert_eq!(url, "https://payloads.test/c");
        assert_eq!(params.get("mode").map(String::as_str), Some("full"));
        assert_eq!(params.get("retry").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_split_fragment_decodes_percent_escapes() {
        let (_, params) = split_fragment("https://p.test/c#note=a%20b+c");
        assert_eq!(params.get("note").map(String::as_str), Some("a b c"));
    }

    #[test]
    fn test_split_fragment_last_value_wins() {
        let (_, params) = split_fragment("https://p.test/c#k=1&k=2");
        assert_eq!(params.get("k").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_split_fragment_empty_fragment() {
        let (url, params) = split_fragment("https://p.test/c#");
        assert_eq!(url, "https://p.test/c");
        assert!(params.is_empty());
    }

    // ------------------------------------------------------------------
    // Probe
    // ------------------------------------------------------------------

    #[test]
    fn test_probe_png_is_well_formed() {
        assert_eq!(PROBE_PNG.len(), 83);
        assert_eq!(&PROBE_PNG[..8], &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a]);
        assert_eq!(&PROBE_PNG[PROBE_PNG.len() - 8..][..4], b"IEND");
    }

    #[test]
    fn test_probe_answers_valid_token() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let raw = make_probe_token(&signer, "primary", 1_000);
        assert_eq!(
            pipeline.probe_at(&raw, 999),
            CommandDisposition::ProbeImage(PROBE_PNG)
        );
        // The boundary moment is still valid.
        assert_eq!(
            pipeline.probe_at(&raw, 1_000),
            CommandDisposition::ProbeImage(PROBE_PNG)
        );
    }

    #[test]
    fn test_probe_ignores_expired_token() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let raw = make_probe_token(&signer, "primary", 1_000);
        assert_eq!(pipeline.probe_at(&raw, 1_001), CommandDisposition::NotForUs);
    }

    #[test]
    fn test_probe_ignores_unknown_key_and_forgery() {
        let signer = SigningKey::generate(&mut OsRng);
        let intruder = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let unknown = make_probe_token(&signer, "retired", 1_000);
        assert_eq!(pipeline.probe_at(&unknown, 500), CommandDisposition::NotForUs);

        let forged = make_probe_token(&intruder, "primary", 1_000);
        assert_eq!(pipeline.probe_at(&forged, 500), CommandDisposition::NotForUs);
    }

    #[test]
    fn test_probe_ignores_malformed_token() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());
        assert_eq!(pipeline.probe_at("just-noise", 0), CommandDisposition::NotForUs);
    }

    // ------------------------------------------------------------------
    // GET phase
    // ------------------------------------------------------------------

    const MANAGER: PrincipalContext = PrincipalContext::Authenticated { can_manage: true };

    #[tokio::test]
    async fn test_get_renders_confirmation() {
        let signer = SigningKey::generate(&mut OsRng);
        let tokens = StaticTokens::accepting();
        let (pipeline, _, _) = make_pipeline(&signer, tokens.clone());

        let raw = make_command_token(&signer, "primary", "https://p.test/c", "n-1", "Main Controller");
        let disposition = pipeline
            .handle_get(&raw, MANAGER, "https://host.test/?stwc=...")
            .await
            .unwrap();

        let CommandDisposition::Confirm(page) = disposition else {
            panic!("expected confirmation, got {disposition:?}");
        };
        assert_eq!(page.label, "Main Controller");
        assert_eq!(page.form_action, "https://host.test/?stwc=...");
        assert_eq!(page.form_token, "token-for-run-https://p.test/c");
        assert_eq!(
            tokens.scopes.lock().unwrap().as_slice(),
            ["run-https://p.test/c"]
        );
    }

    #[tokio::test]
    async fn test_get_ignores_foreign_traffic() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let disposition = pipeline
            .handle_get("some=unrelated&query=param", MANAGER, "u")
            .await
            .unwrap();
        assert_eq!(disposition, CommandDisposition::NotForUs);
    }

    #[tokio::test]
    async fn test_get_rejects_unknown_key_without_state_change() {
        let signer = SigningKey::generate(&mut OsRng);
        let tokens = StaticTokens::accepting();
        let (pipeline, store, _) = make_pipeline(&signer, tokens.clone());

        let raw = make_command_token(&signer, "retired", "https://p.test/c", "n-1", "l");
        let disposition = pipeline.handle_get(&raw, MANAGER, "u").await.unwrap();

        assert_eq!(
            disposition,
            CommandDisposition::ErrorPage {
                message: "permission denied".to_string()
            }
        );
        assert!(tokens.scopes.lock().unwrap().is_empty());
        // The nonce was not burned by the refused request.
        assert_eq!(
            store.consume_nonce("n-1", 0).await.unwrap(),
            NonceOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn test_get_rejects_tampered_signature() {
        let signer = SigningKey::generate(&mut OsRng);
        let intruder = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let raw = make_command_token(&intruder, "primary", "https://p.test/c", "n-1", "l");
        let disposition = pipeline.handle_get(&raw, MANAGER, "u").await.unwrap();
        assert_eq!(
            disposition,
            CommandDisposition::ErrorPage {
                message: "permission denied".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_get_redirects_anonymous_principal() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let raw = make_command_token(&signer, "primary", "https://p.test/c", "n-1", "l");
        let disposition = pipeline
            .handle_get(&raw, PrincipalContext::Anonymous, "https://host.test/?stwc=x")
            .await
            .unwrap();
        assert_eq!(
            disposition,
            CommandDisposition::LoginRedirect {
                return_to: "https://host.test/?stwc=x".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_get_refuses_principal_without_capability() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, _, _) = make_pipeline(&signer, StaticTokens::accepting());

        let raw = make_command_token(&signer, "primary", "https://p.test/c", "n-1", "l");
        let disposition = pipeline
            .handle_get(&raw, PrincipalContext::Authenticated { can_manage: false }, "u")
            .await
            .unwrap();
        assert_eq!(
            disposition,
            CommandDisposition::ErrorPage {
                message: "permission denied".to_string()
            }
        );
    }

    // ------------------------------------------------------------------
    // POST phase (network-free paths; the full flow lives in tests/)
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_post_rejects_bad_form_token_before_nonce() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, store, executor) = make_pipeline(&signer, StaticTokens::rejecting());

        let raw = make_command_token(&signer, "primary", "https://p.test/c", "n-1", "l");
        let disposition = pipeline
            .handle_post(&raw, MANAGER, "u", "stale-token")
            .await
            .unwrap();

        assert_eq!(
            disposition,
            CommandDisposition::ErrorPage {
                message: "invalid confirmation token, please retry".to_string()
            }
        );
        // The nonce survives a failed confirmation and no payload ran.
        assert_eq!(
            store.consume_nonce("n-1", 0).await.unwrap(),
            NonceOutcome::Fresh
        );
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_burns_nonce_then_reports_fetch_failure() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, store, executor) = make_pipeline(&signer, StaticTokens::accepting());

        // Nothing is listening on this port; the fetch fails after the
        // nonce has been consumed.
        let raw = make_command_token(&signer, "primary", "http://127.0.0.1:9/c", "n-1", "l");
        let disposition = pipeline.handle_post(&raw, MANAGER, "u", "t").await.unwrap();

        let CommandDisposition::ErrorPage { message } = disposition else {
            panic!("expected error page");
        };
        assert!(message.starts_with("fetch failed:"), "{message}");
        assert_eq!(
            store.consume_nonce("n-1", 0).await.unwrap(),
            NonceOutcome::AlreadyUsed
        );
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_refuses_replayed_nonce() {
        let signer = SigningKey::generate(&mut OsRng);
        let (pipeline, store, _) = make_pipeline(&signer, StaticTokens::accepting());
        store.consume_nonce("n-1", 0).await.unwrap();

        let raw = make_command_token(&signer, "primary", "http://127.0.0.1:9/c", "n-1", "l");
        let disposition = pipeline.handle_post(&raw, MANAGER, "u", "t").await.unwrap();
        assert_eq!(
            disposition,
            CommandDisposition::ErrorPage {
                message: "command already run".to_string()
            }
        );
    }
}
