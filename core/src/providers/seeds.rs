/// Static description of one upstream provider, written into the registry at
/// startup. The environment variable names match the ones the deployment
/// scripts already export.
pub struct ProviderSeed {
    pub id: &'static str,
    pub kind: &'static str,
    pub display: &'static str,
    pub description: &'static str,
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub requires_api_key: bool,
    pub env_key: Option<&'static str>,
}

/// Seed order doubles as the fallback order used by the dispatcher.
pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: "claude",
        kind: "cloud",
        display: "Claude",
        description: "Specialised in coding and technical problem-solving.",
        base_url: "https://api.anthropic.com",
        default_model: "claude-3-opus-20240229",
        requires_api_key: true,
        env_key: Some("CLAUDE_API_KEY"),
    },
    ProviderSeed {
        id: "chatgpt",
        kind: "cloud",
        display: "ChatGPT",
        description: "General-purpose conversation and creative writing.",
        base_url: "https://api.openai.com",
        default_model: "gpt-4",
        requires_api_key: true,
        env_key: Some("OPENAI_API_KEY"),
    },
    ProviderSeed {
        id: "gemini",
        kind: "cloud",
        display: "Gemini",
        description: "Visual content requests, paired with DALL-E for rendering.",
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        default_model: "gemini-1.5-pro",
        requires_api_key: true,
        env_key: Some("GEMINI_API_KEY"),
    },
    ProviderSeed {
        id: "llama",
        kind: "local",
        display: "LLaMA",
        description: "Quantitative and logical reasoning via a local runtime.",
        base_url: "http://127.0.0.1:11434",
        default_model: "llama3",
        requires_api_key: false,
        env_key: None,
    },
];
