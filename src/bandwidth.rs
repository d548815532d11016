//! Token-bucket rate limiting.
//!
//! The engine does not impose a throttling policy; this limiter is the
//! hook an embedder points at its own. Acquire before moving bytes and
//! the bucket turns a configured rate into sleep time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A token bucket refilled continuously at the configured rate, with a
/// burst allowance of twice the rate.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Arc::new(Self {
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::MAX,
                max_tokens: f64::MAX,
                tokens_per_sec: f64::MAX,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Takes `bytes` from the bucket, returning how long the caller
    /// should wait before proceeding.
    pub fn acquire(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = now;
        bucket.tokens = (bucket.tokens + elapsed * bucket.tokens_per_sec).min(bucket.max_tokens);

        let wanted = bytes as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            Duration::ZERO
        } else {
            let missing = wanted - bucket.tokens;
            bucket.tokens = 0.0;
            Duration::from_secs_f64(missing / bucket.tokens_per_sec)
        }
    }

    /// Bytes available right now.
    pub fn available(&self) -> usize {
        self.bucket.lock().tokens as usize
    }
}

/// Paired download/upload limiters. A limit of zero means unlimited.
pub struct BandwidthLimiter {
    download: Arc<RateLimiter>,
    upload: Arc<RateLimiter>,
}

impl BandwidthLimiter {
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        Self {
            download: Self::limiter(download_limit),
            upload: Self::limiter(upload_limit),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    fn limiter(bytes_per_sec: u64) -> Arc<RateLimiter> {
        if bytes_per_sec == 0 {
            RateLimiter::unlimited()
        } else {
            RateLimiter::new(bytes_per_sec)
        }
    }

    pub fn set_download_limit(&mut self, bytes_per_sec: u64) {
        self.download = Self::limiter(bytes_per_sec);
    }

    pub fn set_upload_limit(&mut self, bytes_per_sec: u64) {
        self.upload = Self::limiter(bytes_per_sec);
    }

    /// Waits until `bytes` of download budget are available.
    pub async fn acquire_download(&self, bytes: usize) {
        let wait = self.download.acquire(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Waits until `bytes` of upload budget are available.
    pub async fn acquire_upload(&self, bytes: usize) {
        let wait = self.upload.acquire(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_drains_and_reports_wait() {
        let limiter = RateLimiter::new(1000);

        // the burst allowance covers 2000 bytes up front
        assert_eq!(limiter.acquire(2000), Duration::ZERO);

        // the next kilobyte must wait about a second
        let wait = limiter.acquire(1000);
        assert!(wait > Duration::from_millis(900));
        assert!(wait <= Duration::from_millis(1100));
    }

    #[test]
    fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..100 {
            assert_eq!(limiter.acquire(usize::MAX / 2), Duration::ZERO);
        }
    }
}
