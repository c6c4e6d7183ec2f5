use std::sync::atomic::{AtomicU64, Ordering};

/// 进程生命周期内的请求计数，只进不出；
/// 流式请求无论中断与否，只要有数据送达就算成功
#[derive(Debug, Default)]
pub struct RequestStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl RequestStats {
    pub fn request_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_error(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = RequestStats::default();
        stats.request_start();
        stats.request_start();
        stats.request_success();
        stats.request_error();
        assert_eq!(stats.snapshot(), (2, 1, 1));
    }
}
