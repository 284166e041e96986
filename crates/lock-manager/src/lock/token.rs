//! 锁 key 与 fencing token

use std::fmt;
use uuid::Uuid;

/// 拼接带命名空间前缀的锁 key
pub fn lock_key(prefix: &str, lock_name: &str) -> String {
    format!("{}{}", prefix, lock_name)
}

/// fencing token
///
/// 格式为 `{instance_id}:{uuid}`，每次获取锁时重新生成。
/// 只有出示当前占据 key 的 token 才能释放或续期该锁。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub(crate) fn mint(instance_id: &str) -> Self {
        Self(format!("{}:{}", instance_id, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// token 中嵌入的实例标识，仅用于诊断
    pub fn instance_id(&self) -> Option<&str> {
        self.0.split_once(':').map(|(instance, _)| instance)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LockToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
