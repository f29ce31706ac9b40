//! Admission chain: verify credential, resolve identity, resolve tier,
//! check the ledger, then forward or reject.

use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

use crate::{
    cache::CounterStore,
    config::{ClassSettings, EndpointClass, Settings},
    identity::{IdentityResolver, PartitionKey},
    limiter::{AdmissionLedger, Decision, Ticket},
    metrics::Metrics,
    tier::{Tier, TierLookup, TierResolver},
    token::{Claim, CredentialFailure, Role, TokenVerifier},
    utils::TimeSource,
};

/// Whether the target endpoint demands a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    /// Verify when possible, otherwise proceed anonymously
    Optional,
}

/// Everything the chain needs to know about one inbound request
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub authorization: Option<String>,
    pub peer: SocketAddr,
    pub forwarded_for: Option<String>,
    pub class: EndpointClass,
    pub auth_mode: AuthMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Unauthorized,
    Forbidden,
    TooManyRequests,
    Internal,
}

impl StatusCategory {
    pub fn status_code(self) -> u16 {
        match self {
            StatusCategory::Unauthorized => 401,
            StatusCategory::Forbidden => 403,
            StatusCategory::TooManyRequests => 429,
            StatusCategory::Internal => 500,
        }
    }
}

/// Stable caller-facing error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoToken,
    InvalidToken,
    TokenExpired,
    RateLimitExceeded,
    AuthRateLimitExceeded,
    UploadRateLimitExceeded,
    AiRateLimitExceeded,
    Forbidden,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoToken => "NO_TOKEN",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::AuthRateLimitExceeded => "AUTH_RATE_LIMIT_EXCEEDED",
            ErrorCode::UploadRateLimitExceeded => "UPLOAD_RATE_LIMIT_EXCEEDED",
            ErrorCode::AiRateLimitExceeded => "AI_RATE_LIMIT_EXCEEDED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    fn rate_limited(class: EndpointClass) -> (Self, &'static str) {
        match class {
            EndpointClass::General => (
                ErrorCode::RateLimitExceeded,
                "Too many requests, please try again later.",
            ),
            EndpointClass::Auth => (
                ErrorCode::AuthRateLimitExceeded,
                "Too many authentication attempts, please try again later.",
            ),
            EndpointClass::Upload => (
                ErrorCode::UploadRateLimitExceeded,
                "Upload limit exceeded, please try again later.",
            ),
            EndpointClass::Ai => (
                ErrorCode::AiRateLimitExceeded,
                "AI request limit exceeded, please try again later.",
            ),
        }
    }
}

/// Quota metadata exposed to clients so they can self-throttle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after_ms: u64,
}

impl From<&Decision> for RateLimitInfo {
    fn from(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_after_ms: decision.reset_after_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCategory,
    pub code: ErrorCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl Rejection {
    fn new(status: StatusCategory, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after_ms: None,
            rate_limit: None,
        }
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCategory::Internal,
            ErrorCode::InternalError,
            "An error occurred during admission",
        )
    }

    fn from_credential(failure: &CredentialFailure) -> Self {
        match failure {
            CredentialFailure::Missing => Self::new(
                StatusCategory::Unauthorized,
                ErrorCode::NoToken,
                "Authentication token is required",
            ),
            CredentialFailure::Malformed => Self::new(
                StatusCategory::Unauthorized,
                ErrorCode::InvalidToken,
                "Invalid authentication token",
            ),
            CredentialFailure::Expired => Self::new(
                StatusCategory::Unauthorized,
                ErrorCode::TokenExpired,
                "Authentication token has expired",
            ),
            CredentialFailure::Internal(_) => Self::new(
                StatusCategory::Internal,
                ErrorCode::InternalError,
                "An error occurred during authentication",
            ),
        }
    }

    fn rate_limited(class: EndpointClass, decision: &Decision) -> Self {
        let (code, message) = ErrorCode::rate_limited(class);
        Self {
            status: StatusCategory::TooManyRequests,
            code,
            message: message.to_string(),
            retry_after_ms: decision.retry_after_ms,
            rate_limit: Some(RateLimitInfo::from(decision)),
        }
    }
}

/// A counted request that may be released once the handler has run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleTicket {
    pub ticket: Ticket,
    pub skip_successful: bool,
    /// Bucket metadata as of the check
    pub rate_limit: RateLimitInfo,
}

/// A request cleared to reach its handler
#[derive(Debug, Clone)]
pub struct Admission {
    pub claim: Option<Claim>,
    pub partition: PartitionKey,
    pub tier: Tier,
    /// Most restrictive bucket the request was counted in
    pub rate_limit: RateLimitInfo,
    pub tickets: Vec<SettleTicket>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Forward(Admission),
    Reject(Rejection),
}

fn most_restrictive(buckets: impl IntoIterator<Item = RateLimitInfo>) -> Option<RateLimitInfo> {
    buckets.into_iter().min_by_key(|info| info.remaining)
}

/// Role gate layered on top of admission
pub fn require_role(claim: Option<&Claim>, role: Role) -> Result<(), Rejection> {
    match claim {
        Some(claim) if claim.role >= role => Ok(()),
        _ => Err(Rejection::new(
            StatusCategory::Forbidden,
            ErrorCode::Forbidden,
            "Insufficient role for this resource",
        )),
    }
}

pub struct AdmissionChain {
    verifier: TokenVerifier,
    identity: IdentityResolver,
    tiers: TierResolver,
    ledger: AdmissionLedger,
    classes: ClassSettings,
    tiered_general: bool,
    metrics: Arc<Metrics>,
}

impl AdmissionChain {
    pub fn new(
        settings: &Settings,
        lookup: Arc<dyn TierLookup>,
        store: Box<dyn CounterStore>,
        metrics: Arc<Metrics>,
        time_source: TimeSource,
    ) -> Self {
        Self {
            verifier: TokenVerifier::with_time_source(&settings.token, time_source),
            identity: IdentityResolver::new(&settings.identity),
            tiers: TierResolver::new(lookup, &settings.tiers, metrics.clone()),
            ledger: AdmissionLedger::new(store, settings.tiers.quotas.clone(), metrics.clone()),
            classes: settings.classes.clone(),
            tiered_general: settings.tiered_general,
            metrics,
        }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Run the full chain for one request
    pub async fn admit(&self, request: &AdmissionRequest) -> Outcome {
        let _timer = self.metrics.start_check_timer();
        let class = request.class;

        let claim = match request.auth_mode {
            AuthMode::Required => match self.verifier.verify(request.authorization.as_deref()) {
                Ok(claim) => Some(claim),
                Err(failure) => {
                    self.metrics.record_credential_failure(failure.kind());
                    if let CredentialFailure::Internal(reason) = &failure {
                        warn!(%reason, "Token verification failed unexpectedly");
                    }
                    self.metrics.record_admission(class.as_str(), "unauthenticated");
                    return Outcome::Reject(Rejection::from_credential(&failure));
                }
            },
            AuthMode::Optional => self.verifier.verify_optional(request.authorization.as_deref()),
        };

        let partition = self.identity.resolve(
            claim.as_ref(),
            request.peer,
            request.forwarded_for.as_deref(),
        );
        let tier = self.tiers.resolve_tier(&partition, claim.as_ref()).await;

        let mut tickets = Vec::with_capacity(2);

        let general = if self.tiered_general {
            self.ledger.check(&partition, tier).await
        } else {
            self.ledger
                .check_bucket(&partition.to_string(), self.classes.general.quota())
                .await
        };
        if let Err(rejection) = self.settle_check(EndpointClass::General, general, &mut tickets) {
            return self.reject(class, &partition, rejection);
        }

        if class != EndpointClass::General {
            let bucket = format!("{}|{}", class.as_str(), partition);
            let checked = self
                .ledger
                .check_bucket(&bucket, self.classes.policy(class).quota())
                .await;
            if let Err(rejection) = self.settle_check(class, checked, &mut tickets) {
                return self.reject(class, &partition, rejection);
            }
        }

        let rate_limit = most_restrictive(tickets.iter().map(|t| t.rate_limit)).unwrap_or(
            RateLimitInfo {
                limit: 0,
                remaining: 0,
                reset_after_ms: 0,
            },
        );

        self.metrics.record_admission(class.as_str(), "admitted");
        Outcome::Forward(Admission {
            claim,
            partition,
            tier,
            rate_limit,
            tickets,
        })
    }

    fn settle_check(
        &self,
        bucket_class: EndpointClass,
        checked: crate::error::Result<Decision>,
        tickets: &mut Vec<SettleTicket>,
    ) -> Result<(), Rejection> {
        let decision = checked.map_err(|_| Rejection::internal())?;
        tickets.push(SettleTicket {
            ticket: decision.ticket.clone(),
            skip_successful: self.classes.policy(bucket_class).skip_successful_requests,
            rate_limit: RateLimitInfo::from(&decision),
        });
        if decision.admit {
            Ok(())
        } else {
            Err(Rejection::rate_limited(bucket_class, &decision))
        }
    }

    fn reject(
        &self,
        class: EndpointClass,
        partition: &PartitionKey,
        rejection: Rejection,
    ) -> Outcome {
        let outcome = match rejection.status {
            StatusCategory::TooManyRequests => "rate_limited",
            _ => "error",
        };
        info!(
            key = %partition,
            class = class.as_str(),
            code = rejection.code.as_str(),
            retry_after_ms = ?rejection.retry_after_ms,
            "Request rejected"
        );
        self.metrics.record_admission(class.as_str(), outcome);
        Outcome::Reject(rejection)
    }

    /// Confirm or roll back an admission once the downstream outcome is known.
    /// Buckets with `skip_successful_requests` release their hit on success.
    /// Returns the rate-limit metadata with any released hits given back.
    pub async fn settle(&self, admission: &Admission, succeeded: bool) -> RateLimitInfo {
        if !succeeded {
            return admission.rate_limit;
        }

        let mut buckets = Vec::with_capacity(admission.tickets.len());
        for settle in &admission.tickets {
            let mut info = settle.rate_limit;
            if settle.skip_successful {
                match self.ledger.rollback(&settle.ticket).await {
                    Ok(true) => info.remaining = (info.remaining + 1).min(info.limit),
                    Ok(false) => {}
                    Err(e) => warn!(
                        bucket = %settle.ticket.bucket,
                        error = %e,
                        "Failed to release counted request"
                    ),
                }
            }
            buckets.push(info);
        }
        most_restrictive(buckets).unwrap_or(admission.rate_limit)
    }

    /// Health check for the chain's counter store
    pub async fn health_check(&self) -> crate::error::Result<()> {
        self.ledger.health_check().await
    }
}
