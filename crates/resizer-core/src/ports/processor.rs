//! TaskProcessor port - タスク固有の処理
//!
//! consumer はペイロードの中身を知りません。
//! 成功なら出力 URL とメタデータ、失敗なら失敗したステージと理由を返します。

use async_trait::async_trait;

use crate::domain::{Payload, ProcessFailure, ProcessSuccess};

#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(
        &self,
        task_id: &str,
        payload: &Payload,
    ) -> Result<ProcessSuccess, ProcessFailure>;
}
