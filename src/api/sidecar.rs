//! The sidecar's request surface — `POST /v1/chat/completions`.
//!
//! This is intentionally a thin layer: classification lives in
//! [`crate::classifier`], the decision in [`crate::router`], and the upstream
//! call in [`crate::upstream`]. The handler parses, composes, forwards, and
//! streams the upstream response back byte-for-byte — including SSE framing
//! for `stream: true` requests.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap},
    middleware,
    response::Response,
    routing::{get, post},
    Extension, Router,
};
use futures_util::StreamExt as _;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    api::request_id::{request_id_middleware, RequestId},
    classifier::{classify, Message},
    error::SidecarError,
    models::{parse_virtual_model_id, VIRTUAL_AUTO},
    router::{make_routing_decision, RequestContext, RoutingReason, SidecarState},
    upstream::MeteredStream,
};

/// Build the sidecar's axum router.
pub fn router(state: Arc<SidecarState>) -> Router {
    Router::new()
        .route("/health", get(crate::api::health::health))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// `POST /v1/chat/completions` — classify, decide, forward, stream back.
async fn chat_completions(
    State(state): State<Arc<SidecarState>>,
    Extension(RequestId(run_id)): Extension<RequestId>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Result<Response, SidecarError> {
    let mut body: Value =
        serde_json::from_slice(&raw_body).map_err(|e| SidecarError::Parse(e.to_string()))?;
    let config = state.config();

    // Only virtual ids reach the routing pipeline; phase 1 defines exactly
    // one of them.
    let original_model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let id = parse_virtual_model_id(&original_model)
        .map_err(|e| SidecarError::VirtualModel(e.to_string()))?;
    if !id.is_virtual() || original_model != VIRTUAL_AUTO {
        return Err(SidecarError::VirtualModel(format!(
            "unsupported model `{original_model}`: only `{VIRTUAL_AUTO}` is routable"
        )));
    }

    // Messages that fail to deserialize contribute nothing to classification.
    let messages: Vec<Message> = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| serde_json::from_value(m.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let classification = classify(&messages);
    debug!(
        tier = %classification.tier,
        confidence = classification.confidence,
        signals = ?classification.signals,
        "classified"
    );

    let ctx = RequestContext {
        original_model: &original_model,
        pinned_header: headers.get("x-model-pinned").and_then(|v| v.to_str().ok()),
    };
    let decision =
        make_routing_decision(&classification, &config, &ctx, &run_id, &state.services());

    info!(
        model = %decision.model,
        provider = %decision.provider,
        tier = %decision.tier,
        reason = %decision.reason,
        applied = decision.applied,
        savings = decision.shadow.estimated_savings,
        "routing decision"
    );
    if let Ok(shadow) = serde_json::to_string(&decision.shadow) {
        debug!(%shadow, "shadow recommendation");
    }

    // A budget block is the one non-applied outcome the sidecar refuses
    // outright rather than forwarding.
    if decision.reason == RoutingReason::RoutingDisabled {
        if let Some(check) = decision.budget.as_ref().filter(|b| !b.allowed) {
            return Err(SidecarError::BudgetExceeded {
                tier: decision.tier.to_string(),
                budget: check.clone(),
            });
        }
    }

    // Rewrite the outgoing body in place
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(decision.model.clone()));
        if let Some(thinking) = &decision.thinking {
            obj.insert(
                "thinking".into(),
                serde_json::to_value(thinking).expect("thinking serializes"),
            );
        }
    }

    let upstream = state
        .upstreams
        .get(&decision.provider)
        .ok_or_else(|| SidecarError::UnknownProvider(decision.provider.clone()))?;

    let t0 = Instant::now();
    let upstream_response = upstream.forward(&body, &decision.headers).await?;

    let status = upstream_response.status();
    let content_type = upstream_response.headers().get(header::CONTENT_TYPE).cloned();

    // Completion hook: when the upstream body finishes streaming, record
    // latency and best-effort usage. A client disconnect drops the stream
    // without firing it, so cancelled requests record nothing.
    let input_tokens = estimate_input_tokens(&state, &messages);
    let model = decision.model.clone();
    let tier = decision.tier;
    let success = status.is_success();
    let hook_state = Arc::clone(&state);
    let hook = move |body_bytes: u64| {
        let latency_ms = t0.elapsed().as_millis() as i64;
        // Rough output estimate: ~4 bytes per token of streamed content
        let output_tokens = body_bytes / 4;
        hook_state.latency.record_latency(&model, latency_ms, output_tokens);
        if success {
            if let Some(tracker) = &hook_state.budget {
                let cost = hook_state
                    .pricing
                    .estimate_model_cost(&model, input_tokens, output_tokens);
                tracker.record(tier, cost);
            }
        }
    };

    let stream = MeteredStream::new(upstream_response.bytes_stream().boxed(), hook);

    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| SidecarError::Internal(anyhow::Error::new(e)))
}

/// Token estimate for the inbound messages: BPE count when the tokenizer
/// loaded, bytes/4 otherwise.
fn estimate_input_tokens(state: &SidecarState, messages: &[Message]) -> u64 {
    let text = messages.iter().map(Message::text).collect::<Vec<_>>().join("\n");
    match &state.tokenizer {
        Some(bpe) => bpe.encode_ordinary(&text).len() as u64,
        None => (text.len() / 4) as u64,
    }
}
