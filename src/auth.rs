//! 认证服务：Basic 凭据校验，以及用户子目录、路径前缀与限速的查询。

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, HashMethod, UserRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("unsupported hash method: {0:?}")]
    UnsupportedHashMethod(String),
    #[error("no such user: {0}")]
    UserNotFound(String),
}

/// 分发器依赖的认证能力，可替换为其他凭据后端。
pub trait AuthService: Send + Sync {
    /// 至少配置了一个用户时启用认证。
    fn is_enabled(&self) -> bool;

    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// 用户被限制访问的子目录（相对于服务根目录）。
    fn authorized_sub_dir(&self, username: &str) -> Result<PathBuf, AuthError>;

    fn path_prefix(&self, username: &str) -> Result<String, AuthError>;

    /// 用户的限速（字节/秒），0 表示不限速。
    fn speed_limit(&self, username: &str) -> Result<u64, AuthError>;

    /// 是否允许列出目录内容，默认不允许。
    fn can_list_directory(&self, _username: &str) -> Result<bool, AuthError> {
        Ok(false)
    }
}

/// 基于配置文件用户列表的认证服务，构造后只读。
#[derive(Debug, Default)]
pub struct BasicAuthService {
    users: HashMap<String, UserRecord>,
    default_speed_limit: u64,
}

impl BasicAuthService {
    pub fn new(users: Vec<UserRecord>, default_speed_limit: u64) -> Self {
        let mut map = HashMap::with_capacity(users.len());
        for user in users {
            if let Some(previous) = map.insert(user.username.clone(), user) {
                warn!(username = %previous.username, "duplicate user record, keeping the last one");
            }
        }
        Self {
            users: map,
            default_speed_limit,
        }
    }

    /// 只有一个用户时返回其用户名，用于启动信息。
    pub fn single_user(&self) -> Option<&str> {
        match self.users.len() {
            1 => self.users.keys().next().map(String::as_str),
            _ => None,
        }
    }

    /// 启动时校验：密码哈希与算法非空，子目录位于根目录下且存在。
    pub fn check(&self, root: &Path) -> Result<(), ConfigError> {
        for user in self.users.values() {
            if user.password_hash.is_empty() {
                return Err(ConfigError::MissingPasswordHash(user.username.clone()));
            }
            if user.hash_method.is_empty() {
                return Err(ConfigError::MissingHashMethod(user.username.clone()));
            }
            let confined = Path::new(&user.sub_dir)
                .components()
                .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
            let user_dir = root.join(&user.sub_dir);
            if !confined || !user_dir.is_dir() {
                return Err(ConfigError::UserDirNotFound(user_dir));
            }
            debug!(username = %user.username, dir = %user_dir.display(), "user checked");
        }
        Ok(())
    }

    fn user(&self, username: &str) -> Result<&UserRecord, AuthError> {
        self.users
            .get(username)
            .ok_or_else(|| AuthError::UserNotFound(username.to_string()))
    }
}

impl AuthService for BasicAuthService {
    fn is_enabled(&self) -> bool {
        !self.users.is_empty()
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let Some(user) = self.users.get(username) else {
            // 与 sha256 分支做同样的工作，未知用户与密码错误不可区分。
            let _ = sha256_matches(password, "");
            debug!(username, "no such user");
            return Err(AuthError::InvalidCredentials);
        };

        let matched = match &user.hash_method {
            HashMethod::Bcrypt => match bcrypt::verify(password, &user.password_hash) {
                Ok(matched) => matched,
                Err(err) => {
                    debug!(username, error = %err, "bcrypt compare error");
                    false
                }
            },
            HashMethod::Sha256 => sha256_matches(password, &user.password_hash),
            HashMethod::Other(method) => {
                return Err(AuthError::UnsupportedHashMethod(method.clone()));
            }
        };

        if matched && user.username == username {
            Ok(())
        } else {
            debug!(username, "password mismatch");
            Err(AuthError::InvalidCredentials)
        }
    }

    fn authorized_sub_dir(&self, username: &str) -> Result<PathBuf, AuthError> {
        Ok(PathBuf::from(&self.user(username)?.sub_dir))
    }

    fn path_prefix(&self, username: &str) -> Result<String, AuthError> {
        Ok(self.user(username)?.path_prefix.clone())
    }

    fn speed_limit(&self, username: &str) -> Result<u64, AuthError> {
        match self.user(username)?.speed_limit {
            0 => Ok(self.default_speed_limit),
            limit => Ok(limit),
        }
    }

    fn can_list_directory(&self, username: &str) -> Result<bool, AuthError> {
        Ok(self.user(username)?.show_directory)
    }
}

fn sha256_matches(password: &str, expected_hex: &str) -> bool {
    let actual = hex::encode(Sha256::digest(password.as_bytes()));
    actual.as_bytes().ct_eq(expected_hex.as_bytes()).into()
}
