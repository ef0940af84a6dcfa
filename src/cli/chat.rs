//! Interactive chat session.
//!
//! Drives the retrieve-then-refine pipeline once per user line and keeps
//! the session transcript. Failures degrade to visible messages; nothing
//! here terminates the loop.

use std::io::Write;

use tracing::warn;

use crate::config::AppConfig;
use crate::conversation::Transcript;
use crate::dataset;
use crate::services::google_ai::GoogleAiClient;
use crate::services::{
    GoogleAiEmbedder, IngestService, QueryService, RefineService, RetrievalOutcome,
};
use crate::vector_store::VectorStore;

const NO_MATCH_MESSAGE: &str = "Sorry, I couldn't find a relevant answer.";
const EMBEDDING_ERROR_MESSAGE: &str = "Error generating embedding for your query.";

/// Resolve one user query to a displayable reply.
///
/// A no-match message passes through refinement like a real answer; a
/// retrieval error is shown as-is.
pub async fn answer(
    query_service: &QueryService<'_>,
    refine_service: &RefineService<'_>,
    input: &str,
) -> String {
    let raw = match query_service.retrieve(input).await {
        Ok(RetrievalOutcome::Match { answer, .. }) => answer,
        Ok(RetrievalOutcome::NoMatch { .. }) => NO_MATCH_MESSAGE.to_string(),
        Err(error) => {
            warn!(error = %error, category = error.category(), "Retrieval failed");
            return EMBEDDING_ERROR_MESSAGE.to_string();
        }
    };

    refine_service.refine(&raw).await
}

/// Run the interactive chat session.
pub async fn run(
    config: &AppConfig,
    client: &GoogleAiClient,
    embedder: &GoogleAiEmbedder,
    store: &VectorStore,
) -> anyhow::Result<()> {
    // Populate the store on startup; a populated store is left untouched.
    let pairs = dataset::load_qa_pairs(&config.dataset_path)?;
    IngestService::new(embedder, store).run(&pairs).await?;

    let query_service = QueryService::new(embedder, store, config.distance_threshold);
    let refine_service = RefineService::new(client);
    let mut transcript = Transcript::new();

    println!("FAQ chatbot ready. Ask a question (Ctrl+D to exit).");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break; // EOF
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let reply = answer(&query_service, &refine_service, input).await;

        transcript.push_user(input);
        transcript.push_bot(reply.as_str());

        println!("Bot: {reply}\n");
    }

    Ok(())
}
