//! 凭证提供者
//!
//! 认证与 token 获取对引擎是不透明的：连接与每次重连时向提供者索取
//! 当前有效 token，token 轮换后的重连自动拿到新值。

use crate::im::error::Result;
use async_trait::async_trait;

/// 不透明凭证提供者
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// 返回当前有效的认证 token
    async fn token(&self) -> Result<String>;
}

/// 固定 token 实现（测试与简单场景）
pub struct StaticToken(pub String);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
