//! 上传口令校验。

use axum::http::HeaderMap;
use tracing::warn;

/// Header carrying the shared upload secret.
pub const PASSWORD_HEADER: &str = "x-upload-password";

#[derive(Debug)]
pub struct UploadAuth {
    secret: Option<String>,
}

/// 口令缺失、错误或服务端未配置口令。
#[derive(Debug, PartialEq, Eq)]
pub struct Unauthorized;

impl UploadAuth {
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|value| !value.is_empty());
        if secret.is_none() {
            warn!("upload password is not configured, all uploads will be rejected");
        }
        Self { secret }
    }

    /// 校验请求头中的口令；未配置口令时一律拒绝。
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), Unauthorized> {
        let Some(secret) = self.secret.as_deref() else {
            return Err(Unauthorized);
        };
        let presented = headers
            .get(PASSWORD_HEADER)
            .map(|value| value.as_bytes())
            .unwrap_or_default();
        if constant_time_eq(presented, secret.as_bytes()) {
            Ok(())
        } else {
            Err(Unauthorized)
        }
    }
}

/// Compares the full length of the longer input regardless of where the
/// first mismatch is.
fn constant_time_eq(presented: &[u8], expected: &[u8]) -> bool {
    let (diff, _) = compare_all(presented, expected);
    diff == 0
}

/// Returns the accumulated difference and the number of positions visited.
fn compare_all(presented: &[u8], expected: &[u8]) -> (usize, usize) {
    let len = presented.len().max(expected.len());
    let mut diff = presented.len() ^ expected.len();
    let mut visited = 0;
    for i in 0..len {
        let a = presented.get(i).copied().unwrap_or(0);
        let b = expected.get(i).copied().unwrap_or(0);
        diff |= usize::from(a ^ b);
        visited += 1;
    }
    (diff, visited)
}
