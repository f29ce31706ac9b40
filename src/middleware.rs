//! Axum boundary for the admission chain

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use crate::{
    config::EndpointClass,
    service::{
        require_role, AdmissionChain, AdmissionRequest, AuthMode, Outcome, RateLimitInfo,
        Rejection,
    },
    token::{Claim, Role},
    utils::ms_to_header_secs,
};

/// Admission settings for one route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub class: EndpointClass,
    pub auth_mode: AuthMode,
}

impl RoutePolicy {
    pub fn new(class: EndpointClass, auth_mode: AuthMode) -> Self {
        Self { class, auth_mode }
    }
}

#[derive(Clone)]
pub struct AdmissionState {
    pub chain: Arc<AdmissionChain>,
    pub policy: RoutePolicy,
}

impl AdmissionState {
    pub fn new(chain: Arc<AdmissionChain>, policy: RoutePolicy) -> Self {
        Self { chain, policy }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

fn admission_request(request: &Request, policy: RoutePolicy) -> AdmissionRequest {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    AdmissionRequest {
        authorization: header_string(request.headers(), header::AUTHORIZATION.as_str()),
        peer,
        forwarded_for: header_string(request.headers(), "x-forwarded-for"),
        class: policy.class,
        auth_mode: policy.auth_mode,
    }
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert("ratelimit-limit", HeaderValue::from(info.limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(info.remaining));
    headers.insert(
        "ratelimit-reset",
        HeaderValue::from(ms_to_header_secs(info.reset_after_ms)),
    );
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        if let Some(info) = &self.rate_limit {
            insert_rate_limit_headers(headers, info);
        }
        if let Some(retry_after_ms) = self.retry_after_ms {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from(ms_to_header_secs(retry_after_ms)),
            );
        }
        response
    }
}

/// Run the admission chain in front of a route.
///
/// Forwarded requests carry their [`Claim`] (when authenticated) in the request
/// extensions. Responses with a status below 400 count as successful outcomes
/// when settling, and the rate-limit headers reflect any hit released then.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    let admission_request = admission_request(&request, state.policy);

    match state.chain.admit(&admission_request).await {
        Outcome::Forward(admission) => {
            if let Some(claim) = &admission.claim {
                request.extensions_mut().insert(claim.clone());
            }
            request.extensions_mut().insert(admission.tier);

            let mut response = next.run(request).await;
            let succeeded = response.status().as_u16() < 400;
            let rate_limit = state.chain.settle(&admission, succeeded).await;

            insert_rate_limit_headers(response.headers_mut(), &rate_limit);
            response
        }
        Outcome::Reject(rejection) => rejection.into_response(),
    }
}

/// Only administrators may pass. Must run after [`admission_middleware`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    match require_role(request.extensions().get::<Claim>(), Role::Administrator) {
        Ok(()) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ErrorCode, StatusCategory};

    #[test]
    fn test_rejection_response_carries_retry_metadata() {
        let rejection = Rejection {
            status: StatusCategory::TooManyRequests,
            code: ErrorCode::AiRateLimitExceeded,
            message: "AI request limit exceeded, please try again later.".to_string(),
            retry_after_ms: Some(1_500),
            rate_limit: Some(RateLimitInfo {
                limit: 50,
                remaining: 0,
                reset_after_ms: 1_500,
            }),
        };

        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "2");
        assert_eq!(response.headers()["ratelimit-limit"], "50");
        assert_eq!(response.headers()["ratelimit-remaining"], "0");
    }

    #[test]
    fn test_admission_request_from_http_parts() {
        let mut request = Request::builder()
            .uri("/files/upload")
            .header("authorization", "Bearer abc")
            .header("x-forwarded-for", "198.51.100.1")
            .body(axum::body::Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("10.1.1.1:5000".parse::<SocketAddr>().unwrap()));

        let policy = RoutePolicy::new(EndpointClass::Upload, AuthMode::Required);
        let parsed = admission_request(&request, policy);
        assert_eq!(parsed.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(parsed.forwarded_for.as_deref(), Some("198.51.100.1"));
        assert_eq!(parsed.peer, "10.1.1.1:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(parsed.class, EndpointClass::Upload);
    }
}
