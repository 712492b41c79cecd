pub mod repl;

use clap::{ Args as ClapArgs, Parser, Subcommand };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Interactive chat against a completion service.
    Chat(ChatArgs),
    /// Run the completion service that streams replies as newline-delimited JSON.
    Serve(ServeArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ChatArgs {
    /// Base URL of the completion service; requests go to {api_base}/chat/stream.
    #[arg(long, env = "API_URL", default_value = "http://localhost:3000")]
    pub api_base: String,

    /// Shared secret sent as the x-api-key header.
    #[arg(long, env = "API_SECRET_KEY", default_value = "default_api_key", hide_env_values = true)]
    pub api_secret: String,

    /// Directory holding the saved conversation and instructions.
    #[arg(long, env = "CHAT_DATA_DIR", default_value = ".streamchat")]
    pub data_dir: String,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ServeArgs {
    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:3000")]
    pub server_addr: String,

    /// Secret clients must present in the x-api-key header.
    #[arg(long, env = "API_SECRET_KEY", hide_env_values = true)]
    pub api_secret: String,

    /// API key for the OpenAI Responses API.
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub openai_api_key: String,

    /// Base URL for the OpenAI API.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Model name used for completions.
    #[arg(long, env = "MODEL", default_value = "gpt-4.1-mini-2025-04-14")]
    pub model: String,

    /// Upper bound on generated tokens per reply.
    #[arg(long, env = "MAX_OUTPUT_TOKENS", default_value = "300")]
    pub max_output_tokens: u32,

    /// Requests allowed per client IP per minute.
    #[arg(long, env = "REQUESTS_PER_MINUTE", default_value = "10")]
    pub requests_per_minute: u32,
}
