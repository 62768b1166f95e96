//! 准入控制：口令校验、令牌桶限流、并发槽位与容量检查。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{Method, Request};
use axum::{middleware, response::Response};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::config::CREDENTIAL_HEADER;
use crate::error::ApiError;
use crate::estimator::UsageEstimate;
use crate::http::declared_content_length;

/// Admission limits, fixed at startup. Sizes are in bytes.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub credential: String,
    pub rate_per_sec: f64,
    pub burst: u32,
    /// 0 disables the concurrency limit.
    pub max_concurrency: usize,
    pub max_queue_wait: Duration,
    pub max_file_size: u64,
    pub max_storage_size: u64,
}

/// What the gate needs to know about an incoming request.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub mutating: bool,
    pub credential: Option<&'a str>,
    pub declared_length: Option<u64>,
}

/// Token bucket shared by all requests.
///
/// Refills continuously at `rate` tokens per second up to `capacity`, so a
/// fraction of a token accrues between whole seconds.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 创建满桶。
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::starting_at(rate, burst, Instant::now())
    }

    fn starting_at(rate: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst);
        Self {
            rate: if rate.is_finite() { rate.max(0.0) } else { 0.0 },
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// 非阻塞取令牌；失败时返回距下一个令牌的等待时间（无法补充时为 `None`）。
    pub fn try_acquire(&self) -> Result<(), Option<Duration>> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Option<Duration>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        state.last_refill = state.last_refill.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        if self.rate <= 0.0 || self.capacity < 1.0 {
            return Err(None);
        }
        Err(Duration::try_from_secs_f64((1.0 - state.tokens) / self.rate).ok())
    }
}

/// Composed admission pipeline: credential, rate, concurrency, capacity.
///
/// Checks run in that order and stop at the first rejection. A successful
/// admission hands back the concurrency permit; dropping it frees the slot.
pub struct AdmissionGate {
    config: AdmissionConfig,
    bucket: TokenBucket,
    slots: Arc<Semaphore>,
    usage: Arc<dyn UsageEstimate>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig, usage: Arc<dyn UsageEstimate>) -> Self {
        let permits = match config.max_concurrency {
            0 => Semaphore::MAX_PERMITS,
            limit => limit,
        };
        Self {
            bucket: TokenBucket::new(config.rate_per_sec, config.burst),
            slots: Arc::new(Semaphore::new(permits)),
            config,
            usage,
        }
    }

    pub async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
    ) -> Result<OwnedSemaphorePermit, ApiError> {
        if request.mutating {
            self.check_credential(request.credential)?;
        }
        self.check_rate()?;
        let permit = self.acquire_slot().await?;
        if request.mutating {
            self.check_capacity(request.declared_length.unwrap_or(0))?;
        }
        Ok(permit)
    }

    fn check_credential(&self, supplied: Option<&str>) -> Result<(), ApiError> {
        let supplied = supplied.unwrap_or_default();
        if bool::from(supplied.as_bytes().ct_eq(self.config.credential.as_bytes())) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    fn check_rate(&self) -> Result<(), ApiError> {
        self.bucket.try_acquire().map_err(|wait| {
            let retry_after = wait.map(|d| d.as_secs_f64().ceil() as u64).unwrap_or(0);
            ApiError::TooFrequent(retry_after.max(1))
        })
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, ApiError> {
        match tokio::time::timeout(
            self.config.max_queue_wait,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(ApiError::Busy),
        }
    }

    /// 容量检查：当且仅当 `usage + declared > max_storage_size` 时拒绝。
    fn check_capacity(&self, declared: u64) -> Result<(), ApiError> {
        if declared > self.config.max_file_size {
            return Err(ApiError::FileTooLarge);
        }
        let usage = self.usage.current_estimate();
        if usage.saturating_add(declared) > self.config.max_storage_size {
            return Err(ApiError::StorageFull);
        }
        Ok(())
    }

    /// Number of concurrency slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// 准入中间件：通过检查后持有并发槽位直到处理器返回。
pub async fn admission_middleware(
    Extension(gate): Extension<Arc<AdmissionGate>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let mutating = !matches!(*req.method(), Method::GET | Method::HEAD);
    let admission = AdmissionRequest {
        mutating,
        credential: req
            .headers()
            .get(CREDENTIAL_HEADER)
            .and_then(|value| value.to_str().ok()),
        declared_length: declared_content_length(req.headers()),
    };
    let permit = match gate.admit(&admission).await {
        Ok(permit) => permit,
        Err(err) => {
            warn!(
                method = %req.method(),
                path = req.uri().path(),
                reason = %err.message(),
                free_slots = gate.available_slots(),
                "request rejected by admission"
            );
            return Err(err);
        }
    };

    let response = next.run(req).await;
    drop(permit);
    Ok(response)
}
