pub mod cli;
pub mod client;
pub mod conversation;
pub mod export;
pub mod history;
pub mod llm;
pub mod models;
pub mod notify;
pub mod server;
pub mod session;

use cli::{ Args, Command };
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    match args.command {
        Command::Chat(chat) => {
            info!("--- Core Configuration ---");
            info!("Completion API Base: {}", chat.api_base);
            info!("Data Directory: {}", chat.data_dir);
            info!("-------------------------");
            cli::repl::run(chat).await
        }
        Command::Serve(serve) => {
            info!("--- Core Configuration ---");
            info!("Server Address: {}", serve.server_addr);
            info!("OpenAI Base URL: {}", serve.openai_base_url);
            info!("Model: {}", serve.model);
            info!("Max Output Tokens: {}", serve.max_output_tokens);
            info!("Requests Per Minute: {}", serve.requests_per_minute);
            info!("-------------------------");
            Server::from_args(&serve)?.run().await
        }
    }
}
