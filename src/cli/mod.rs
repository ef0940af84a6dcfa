pub mod chat;

use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use crate::config::AppConfig;
use crate::dataset;
use crate::services::google_ai::GoogleAiClient;
use crate::services::{GoogleAiEmbedder, IngestService, QueryService, RefineService};
use crate::vector_store::VectorStore;

#[derive(Parser)]
#[command(name = "faqbot")]
#[command(about = "Retrieval-augmented FAQ chatbot")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Embed the QA dataset and populate the vector store
    Ingest,
    /// Ask a single question
    Ask {
        /// The question to ask
        question: String,
    },
    /// Interactive chat session
    Chat,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let rt = Runtime::new()?;
        rt.block_on(async {
            let config = AppConfig::from_env();
            config.validate()?;

            let client = GoogleAiClient::new(config.google_ai.clone())?;
            let store = VectorStore::open(&config.store_dir, config.dimensions).await?;
            let embedder = GoogleAiEmbedder::new(client.clone(), config.dimensions);

            match self.command {
                Commands::Ingest => {
                    let pairs = dataset::load_qa_pairs(&config.dataset_path)?;
                    let report = IngestService::new(&embedder, &store).run(&pairs).await?;
                    if report.already_populated {
                        println!("Vector store already populated, nothing to do.");
                    } else {
                        println!(
                            "Stored {} records ({} skipped).",
                            report.stored, report.skipped
                        );
                    }
                }
                Commands::Ask { question } => {
                    let query_service =
                        QueryService::new(&embedder, &store, config.distance_threshold);
                    let refine_service = RefineService::new(&client);
                    let reply = chat::answer(&query_service, &refine_service, &question).await;
                    println!("{reply}");
                }
                Commands::Chat => {
                    chat::run(&config, &client, &embedder, &store).await?;
                }
            }

            Ok(())
        })
    }
}
