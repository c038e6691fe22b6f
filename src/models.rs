//! 模型登记表的数据类型，以及同步 upstream 模型列表时使用的内置目录。

use serde::{Deserialize, Serialize};

/// upstream 上可免费调用的模型。
const FREE_MODELS: &[&str] = &[
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B",
    "Qwen/Qwen2.5-7B-Instruct",
    "Qwen/Qwen2.5-Coder-7B-Instruct",
    "Qwen/Qwen2-7B-Instruct",
    "Qwen/Qwen2-1.5B-Instruct",
    "THUDM/chatglm3-6b",
    "BAAI/bge-m3",
    "BAAI/bge-reranker-v2-m3",
    "BAAI/bge-large-zh-v1.5",
    "BAAI/bge-large-en-v1.5",
    "netease-youdao/bce-embedding-base_v1",
    "netease-youdao/bce-reranker-base_v1",
    "internlm/internlm2_5-7b-chat",
];

/// 可以用赠送余额支付的模型。
const GIFTABLE_MODELS: &[&str] = &[
    "deepseek-ai/DeepSeek-R1",
    "deepseek-ai/DeepSeek-V3",
    "deepseek-ai/DeepSeek-V2.5",
    "deepseek-ai/deepseek-vl2",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-14B",
    "Pro/deepseek-ai/DeepSeek-R1-Distill-Qwen-7B",
    "Pro/deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B",
    "Qwen/QwQ-32B",
    "Qwen/QwQ-32B-Preview",
    "Qwen/Qwen2.5-VL-72B-Instruct",
    "Qwen/Qwen2.5-72B-Instruct-128K",
    "Qwen/Qwen2.5-72B-Instruct",
    "Qwen/Qwen2.5-32B-Instruct",
    "Qwen/Qwen2.5-14B-Instruct",
    "Qwen/Qwen2.5-Coder-32B-Instruct",
    "Qwen/QVQ-72B-Preview",
    "Qwen/Qwen2.5-VL-7B-Instruct",
    "Pro/Qwen/Qwen2.5-Coder-7B-Instruct",
    "Pro/Qwen/Qwen2-VL-7B-Instruct",
    "Pro/Qwen/Qwen2.5-7B-Instruct",
    "Pro/Qwen/Qwen2-7B-Instruct",
    "Pro/Qwen/Qwen2-1.5B-Instruct",
    "internlm/internlm2_5-20b-chat",
    "TeleAI/TeleChat2",
    "Pro/THUDM/glm-4-9b-chat",
    "Pro/BAAI/bge-m3",
    "Pro/BAAI/bge-reranker-v2-m3",
];

/// 已知的推理模型，同步时登记为 `ModelType::Reasoning`。
const REASONING_MODELS: &[&str] = &[
    "Qwen/QwQ-32B-Preview",
    "Qwen/QwQ-32B",
    "deepseek-ai/DeepSeek-R1",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-14B",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B",
    "deepseek-ai/DeepSeek-R1-Distill-Llama-70B",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B",
    "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B",
    "deepseek-ai/DeepSeek-R1-Distill-Llama-8B",
    "Pro/deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B",
    "Pro/deepseek-ai/DeepSeek-R1-Distill-Qwen-7B",
    "Pro/deepseek-ai/DeepSeek-R1-Distill-Llama-8B",
    "Pro/deepseek-ai/DeepSeek-R1",
];

/// 模型类别。持久层中以 1 到 7 的整数存储。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Chat,
    Image,
    Video,
    Audio,
    Embedding,
    Rerank,
    Reasoning,
}

impl ModelType {
    pub fn code(self) -> i64 {
        match self {
            ModelType::Chat => 1,
            ModelType::Image => 2,
            ModelType::Video => 3,
            ModelType::Audio => 4,
            ModelType::Embedding => 5,
            ModelType::Rerank => 6,
            ModelType::Reasoning => 7,
        }
    }

    /// 未知编码按对话模型处理。
    pub fn from_code(code: i64) -> Self {
        match code {
            2 => ModelType::Image,
            3 => ModelType::Video,
            4 => ModelType::Audio,
            5 => ModelType::Embedding,
            6 => ModelType::Rerank,
            7 => ModelType::Reasoning,
            _ => ModelType::Chat,
        }
    }
}

/// 模型登记表中的一行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub model_type: ModelType,
    /// 该模型使用的选 key 策略 id；为空时走默认顺序。
    #[serde(default)]
    pub strategy: Option<u8>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub is_giftable: bool,
    /// 只读，由成功调用累加。
    #[serde(default)]
    pub call_count: u64,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            id: id.into(),
            model_type,
            strategy: None,
            is_free: false,
            is_giftable: false,
            call_count: 0,
        }
    }

    /// 从 upstream 模型列表发现的模型，元数据取自内置目录。
    pub fn discovered(id: &str) -> Self {
        let model_type = if REASONING_MODELS.contains(&id) {
            ModelType::Reasoning
        } else {
            ModelType::Chat
        };
        Self {
            is_free: FREE_MODELS.contains(&id),
            is_giftable: GIFTABLE_MODELS.contains(&id),
            ..Self::new(id, model_type)
        }
    }

    pub fn is_reasoning(&self) -> bool {
        self.model_type == ModelType::Reasoning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip_and_default_to_chat() {
        for code in 1..=7 {
            assert_eq!(ModelType::from_code(code).code(), code);
        }
        assert_eq!(ModelType::from_code(42), ModelType::Chat);
        assert_eq!(
            serde_json::to_value(ModelType::Reasoning).unwrap(),
            serde_json::json!("reasoning")
        );
    }

    #[test]
    fn discovered_models_take_catalog_metadata() {
        let qwq = ModelInfo::discovered("Qwen/QwQ-32B");
        assert!(qwq.is_reasoning());
        assert!(qwq.is_giftable);
        assert!(!qwq.is_free);

        let embed = ModelInfo::discovered("BAAI/bge-m3");
        assert_eq!(embed.model_type, ModelType::Chat);
        assert!(embed.is_free);
        assert_eq!(embed.strategy, None);
    }
}
