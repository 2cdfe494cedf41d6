//! Conversational retrieval: binds an index, a chat model and memory.
//!
//! A [`ConversationalChain`] answers one question at a time for one session:
//!
//! ```text
//!  question ──▶ condense (only if memory is non-empty) ──▶ standalone question
//!                                                              │
//!                                  embed + top-k retrieval ◀───┘
//!                                              │
//!  memory += (question, answer) ◀── answer ◀── stuff chunks into QA prompt
//! ```
//!
//! The [`Binder`] builds chains either from a freshly built index (after
//! indexing) or by loading a session's index directory (rehydration after a
//! restart). Rehydrated chains always start with empty memory.

use anyhow::{bail, Result};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{Config, StorageConfig};
use crate::embedding::Embedder;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{ScoredChunk, Turn};
use crate::vector_index::VectorIndex;

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

const QA_PROMPT: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to condense follow-up question: {0:#}")]
    Condense(anyhow::Error),
    #[error("retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),
    #[error("answer generation failed: {0:#}")]
    Completion(anyhow::Error),
}

/// Result of one conversational turn.
#[derive(Debug, Clone)]
pub struct ChainAnswer {
    pub answer: String,
    pub sources: Vec<ScoredChunk>,
}

/// Live conversational handle for one session.
pub struct ConversationalChain {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn ChatModel>,
    top_k: usize,
    memory: Mutex<Vec<Turn>>,
}

impl ConversationalChain {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            llm,
            top_k,
            memory: Mutex::new(Vec::new()),
        }
    }

    /// Answer `question`, using and then extending the conversation memory.
    ///
    /// Turns on the same chain are serialised. Memory is only extended when
    /// the turn succeeds.
    pub async fn ask(&self, question: &str) -> Result<ChainAnswer, ChainError> {
        let mut memory = self.memory.lock().await;

        let standalone = if memory.is_empty() {
            question.to_string()
        } else {
            let messages = condense_messages(&memory, question);
            self.llm
                .complete(&messages)
                .await
                .map_err(ChainError::Condense)?
        };

        let query = self
            .embedder
            .embed_query(&standalone)
            .await
            .map_err(ChainError::Retrieval)?;
        let sources = self.index.search(&query, self.top_k);

        let messages = qa_messages(&sources, question);
        let answer = self
            .llm
            .complete(&messages)
            .await
            .map_err(ChainError::Completion)?;

        memory.push(Turn {
            question: question.to_string(),
            answer: answer.clone(),
        });
        tracing::debug!(turns = memory.len(), sources = sources.len(), "chat turn complete");

        Ok(ChainAnswer { answer, sources })
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> Vec<Turn> {
        self.memory.lock().await.clone()
    }

    /// The index this chain retrieves from.
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }
}

fn format_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("Human: {}\nAssistant: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

fn condense_messages(turns: &[Turn], question: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(CONDENSE_PROMPT),
        ChatMessage::user(format!(
            "Chat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            format_history(turns),
            question
        )),
    ]
}

fn qa_messages(sources: &[ScoredChunk], question: &str) -> Vec<ChatMessage> {
    let context = sources
        .iter()
        .map(|s| s.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    vec![
        ChatMessage::system(format!("{}\n\n{}", QA_PROMPT, context)),
        ChatMessage::user(question.to_string()),
    ]
}

/// Builds [`ConversationalChain`]s with shared providers and retrieval depth.
pub struct Binder {
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn ChatModel>,
    top_k: usize,
    storage: StorageConfig,
}

impl Binder {
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>, llm: Arc<dyn ChatModel>) -> Self {
        Self {
            embedder,
            llm,
            top_k: config.retrieval.top_k,
            storage: config.storage.clone(),
        }
    }

    /// Bind a chain with fresh memory over an in-memory index.
    pub fn bind(&self, index: Arc<VectorIndex>) -> ConversationalChain {
        ConversationalChain::new(index, self.embedder.clone(), self.llm.clone(), self.top_k)
    }

    /// Rebuild a chain from a session's durable index.
    ///
    /// Returns `Ok(None)` when the session has no saved index.
    pub async fn rehydrate(&self, session_id: &str) -> Result<Option<ConversationalChain>> {
        let dir = self.storage.index_dir(session_id);
        if !VectorIndex::exists(&dir) {
            return Ok(None);
        }
        let index = VectorIndex::load(&dir).await?;
        if index.model() != self.embedder.model_name() {
            bail!(
                "index for session {} was built with embedding model '{}', but '{}' is configured",
                session_id,
                index.model(),
                self.embedder.model_name()
            );
        }
        tracing::info!(session_id, chunks = index.len(), "rehydrated session from disk");
        Ok(Some(self.bind(Arc::new(index))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Maps text to a 2-d vector: "apple" → x axis, anything else → y axis.
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("apple") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    /// Records every prompt and replies with a canned answer.
    #[derive(Default)]
    struct RecordingModel {
        calls: StdMutex<Vec<Vec<ChatMessage>>>,
        fail: bool,
    }

    #[async_trait]
    impl ChatModel for RecordingModel {
        fn model_name(&self) -> &str {
            "recording"
        }
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(messages.to_vec());
            if self.fail {
                bail!("model unavailable");
            }
            Ok(format!("answer #{}", calls.len()))
        }
    }

    fn index() -> Arc<VectorIndex> {
        let chunk = |text: &str, page| Chunk {
            id: text.to_string(),
            page,
            chunk_index: page as i64,
            text: text.to_string(),
            hash: String::new(),
        };
        Arc::new(
            VectorIndex::build(
                "axis",
                vec![chunk("apple pie recipe", 0), chunk("banana bread", 1)],
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn first_turn_skips_condense_and_retrieves() {
        let model = Arc::new(RecordingModel::default());
        let chain = ConversationalChain::new(index(), Arc::new(AxisEmbedder), model.clone(), 1);

        let out = chain.ask("how do I make apple pie?").await.unwrap();
        assert_eq!(out.answer, "answer #1");
        assert_eq!(out.sources.len(), 1);
        assert_eq!(out.sources[0].chunk.text, "apple pie recipe");

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0][0].content.contains("apple pie recipe"));
    }

    #[tokio::test]
    async fn second_turn_sees_first_exchange() {
        let model = Arc::new(RecordingModel::default());
        let chain = ConversationalChain::new(index(), Arc::new(AxisEmbedder), model.clone(), 3);

        chain.ask("what about apple?").await.unwrap();
        chain.ask("and the other one?").await.unwrap();

        let calls = model.calls.lock().unwrap();
        // qa, condense, qa
        assert_eq!(calls.len(), 3);
        let condense = &calls[1][1].content;
        assert!(condense.contains("Human: what about apple?"));
        assert!(condense.contains("Assistant: answer #1"));
        assert!(condense.contains("Follow Up Input: and the other one?"));
        assert_eq!(chain.history().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_turn_leaves_memory_untouched() {
        let model = Arc::new(RecordingModel {
            fail: true,
            ..Default::default()
        });
        let chain = ConversationalChain::new(index(), Arc::new(AxisEmbedder), model, 3);
        let err = chain.ask("apple?").await.unwrap_err();
        assert!(matches!(err, ChainError::Completion(_)));
        assert!(err.to_string().contains("model unavailable"));
        assert!(chain.history().await.is_empty());
    }

    #[tokio::test]
    async fn rehydrate_missing_index_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.vectorstores_dir = tmp.path().to_path_buf();
        let binder = Binder::new(
            &config,
            Arc::new(AxisEmbedder),
            Arc::new(RecordingModel::default()),
        );
        assert!(binder.rehydrate("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rehydrate_loads_saved_index_with_empty_memory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.vectorstores_dir = tmp.path().to_path_buf();
        index().save(&config.storage.index_dir("s1")).await.unwrap();

        let binder = Binder::new(
            &config,
            Arc::new(AxisEmbedder),
            Arc::new(RecordingModel::default()),
        );
        let chain = binder.rehydrate("s1").await.unwrap().unwrap();
        assert_eq!(chain.index().len(), 2);
        assert!(chain.history().await.is_empty());
    }
}
