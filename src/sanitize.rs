//! 文件名清洗与最终存储名分配。

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

const FALLBACK_NAME: &str = "unnamed";

/// 将客户端声明的文件名转换为安全的存储名。
///
/// 非 `[A-Za-z0-9._-]` 字符替换为 `_`，连续的 `_` 折叠为一个，
/// 开头的一串 `.` 替换为单个 `_`。
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }

    let trimmed = out.trim_start_matches('.');
    if trimmed.len() != out.len() {
        out = format!("_{trimmed}");
    }

    if out.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    out
}

/// 为上传分配带毫秒前缀的最终文件名，进程内前缀严格递增。
#[derive(Debug, Default)]
pub struct FinalNameAllocator {
    last_millis: AtomicI64,
}

impl FinalNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, hint: Option<&str>) -> String {
        let sanitized = sanitize_filename(hint.unwrap_or(FALLBACK_NAME));
        format!("{}-{}", self.next_millis(), sanitized)
    }

    fn next_millis(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_millis.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
