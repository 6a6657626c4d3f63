//! Task trait - 型付き Task の定義

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Summarize {
///     text: String,
/// }
///
/// impl Task for Summarize {
///     const TYPE: &'static str = "summarize";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: envelope の kwargs に載せるため
/// - `DeserializeOwned`: worker 側で kwargs から復元するため
/// - `Send + Sync + 'static`: Arc に入れて tokio task 間で共有するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// envelope の `task` フィールドに入る名前
    const TYPE: &'static str;
}
