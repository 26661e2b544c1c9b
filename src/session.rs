//! 单次运行的上传口令：启动时生成，运行期间不可变。

use chrono::{DateTime, Utc};
use rand::Rng;

const CODE_MIN: u32 = 100_000;
const CODE_MAX: u32 = 999_999;

/// 持有本次运行唯一的 6 位数字口令。
#[derive(Debug)]
pub struct SessionAuthenticator {
    code: String,
    created_at: DateTime<Utc>,
}

impl SessionAuthenticator {
    /// 生成均匀分布的 6 位随机口令。
    pub fn generate() -> Self {
        let value = rand::rng().random_range(CODE_MIN..=CODE_MAX);
        Self::with_code(value.to_string())
    }

    pub(crate) fn with_code(code: String) -> Self {
        Self {
            code,
            created_at: Utc::now(),
        }
    }

    /// 逐字节精确比较，不做任何规范化。
    pub fn validate(&self, candidate: &str) -> bool {
        self.code == candidate
    }

    /// 用于启动时展示给本机操作者。
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_is_six_digits() {
        for _ in 0..64 {
            let session = SessionAuthenticator::generate();
            assert_eq!(session.code().len(), 6);
            assert!(session.code().bytes().all(|b| b.is_ascii_digit()));
            assert!(session.created_at() <= Utc::now());
        }
    }

    #[test]
    fn validate_accepts_only_exact_code() {
        let session = SessionAuthenticator::with_code("482913".into());
        assert!(session.validate("482913"));
        for candidate in ["", "482914", " 482913", "482913 ", "0482913", "48291", "４８２９１３"] {
            assert!(!session.validate(candidate), "{candidate:?} should be rejected");
        }
    }

    #[test]
    fn code_is_stable_across_validations() {
        let session = SessionAuthenticator::generate();
        let code = session.code().to_string();
        assert!(session.validate(&code));
        assert!(!session.validate("not-a-code"));
        assert_eq!(session.code(), code);
    }
}
