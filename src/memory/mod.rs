//! Knowledge memory: durable card table plus a disposable vector index
//!
//! Cards are stored one JSON document per card under `cards/`. Each document
//! carries the card's embedding, which makes the card table the embedding
//! table too. The in-memory [`FlatIndex`] is only a cache over it and can be
//! rebuilt at any time with [`KnowledgeMemory::rebuild_index`].

pub mod embedding;
pub mod index;

pub use embedding::{l2_normalize, Embedder, HashingEmbedder};
#[cfg(feature = "fastembed-embeddings")]
pub use embedding::FastEmbedder;
pub use index::FlatIndex;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::card::{CardType, KnowledgeCard};
use crate::error::{Error, Result};

/// Card returned by a similarity search
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub card: KnowledgeCard,
    /// Cosine similarity in [-1, 1]
    pub score: f32,
}

struct MemoryState {
    cards: HashMap<String, KnowledgeCard>,
    index: FlatIndex,
}

pub struct KnowledgeMemory {
    cards_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    state: RwLock<MemoryState>,
}

impl KnowledgeMemory {
    /// Open (or create) the card table under `data_dir` and index it
    pub fn open(data_dir: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let cards_dir = data_dir.as_ref().join("cards");
        fs::create_dir_all(&cards_dir)?;

        let cards = load_cards(&cards_dir)?;
        let (cards, index) = build_index(&cards_dir, cards, embedder.as_ref())?;
        info!(
            "Knowledge memory opened at {:?} with {} cards ({} embedder, dim {})",
            cards_dir,
            cards.len(),
            embedder.name(),
            embedder.dimension()
        );

        Ok(Self {
            cards_dir,
            embedder,
            state: RwLock::new(MemoryState { cards, index }),
        })
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Persist a card and index its embedding; re-adding an id overwrites it
    pub async fn add_card(&self, mut card: KnowledgeCard) -> Result<String> {
        let embedding = self.embedder.embed_document(&card.search_text())?;
        card.embedding = Some(embedding.clone());
        let card_id = card.card_id.clone();

        let mut state = self.state.write().await;
        state.index.check_vector(&embedding)?;
        write_card(&self.cards_dir, &card)?;
        state.index.insert(&card_id, embedding)?;
        if state.cards.insert(card_id.clone(), card).is_some() {
            debug!("Overwrote card {}", card_id);
        } else {
            debug!("Indexed card {}", card_id);
        }

        Ok(card_id)
    }

    /// Nearest cards to `query_text`, best first, at most `top_k`
    pub async fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query_text, top_k, None).await
    }

    /// Like [`search`](Self::search), restricted to one card type
    pub async fn search_filtered(
        &self,
        query_text: &str,
        top_k: usize,
        card_type: Option<CardType>,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed_query(query_text)?;

        let state = self.state.read().await;
        if state.index.is_empty() {
            return Ok(Vec::new());
        }

        let window = if card_type.is_some() {
            state.index.len()
        } else {
            top_k
        };

        let mut hits = Vec::new();
        for (card_id, score) in state.index.search(&query, window)? {
            let card = state.cards.get(&card_id).ok_or_else(|| {
                Error::IndexCorruption(format!("indexed card {} missing from table", card_id))
            })?;
            if card_type.is_some_and(|t| t != card.card_type) {
                continue;
            }
            hits.push(SearchHit {
                card: card.clone(),
                score,
            });
            if hits.len() == top_k {
                break;
            }
        }

        Ok(hits)
    }

    /// Reload the card table from disk and rebuild the index from it.
    ///
    /// Cards whose stored embedding is absent or unusable are re-embedded and
    /// written back. Returns the number of indexed cards.
    pub async fn rebuild_index(&self) -> Result<usize> {
        // Held across the reload so no add_card lands between read and swap
        let mut state = self.state.write().await;
        let cards = load_cards(&self.cards_dir)?;
        let (cards, index) = build_index(&self.cards_dir, cards, self.embedder.as_ref())?;
        let count = index.len();

        state.cards = cards;
        state.index = index;

        info!("Rebuilt knowledge index with {} cards", count);
        Ok(count)
    }

    /// Check that index and card table agree
    pub async fn verify_index(&self) -> Result<()> {
        let state = self.state.read().await;

        if state.index.len() != state.cards.len() {
            return Err(Error::IndexCorruption(format!(
                "index holds {} vectors for {} cards",
                state.index.len(),
                state.cards.len()
            )));
        }

        for (card_id, card) in &state.cards {
            let vector = state.index.vector(card_id).ok_or_else(|| {
                Error::IndexCorruption(format!("card {} is not indexed", card_id))
            })?;
            state.index.check_vector(vector)?;
            if card.embedding.as_deref() != Some(vector) {
                return Err(Error::IndexCorruption(format!(
                    "index vector for card {} differs from stored embedding",
                    card_id
                )));
            }
        }

        if let Some(orphan) = state.index.ids().find(|id| !state.cards.contains_key(*id)) {
            return Err(Error::IndexCorruption(format!(
                "index holds a vector for unknown card {}",
                orphan
            )));
        }

        Ok(())
    }

    pub async fn get(&self, card_id: &str) -> Option<KnowledgeCard> {
        self.state.read().await.cards.get(card_id).cloned()
    }

    /// Cards of one task in creation order
    pub async fn cards_for_task(&self, task_id: &str) -> Vec<KnowledgeCard> {
        let state = self.state.read().await;
        let mut cards: Vec<KnowledgeCard> = state
            .cards
            .values()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect();
        cards.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.card_type.cmp(&b.card_type))
        });
        cards
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.cards.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn card_path(cards_dir: &Path, card_id: &str) -> PathBuf {
    cards_dir.join(format!("{}.json", card_id))
}

fn write_card(cards_dir: &Path, card: &KnowledgeCard) -> Result<()> {
    let json = serde_json::to_string_pretty(card)?;
    fs::write(card_path(cards_dir, &card.card_id), json)?;
    Ok(())
}

fn load_cards(cards_dir: &Path) -> Result<Vec<KnowledgeCard>> {
    let mut cards = Vec::new();
    if !cards_dir.exists() {
        return Ok(cards);
    }

    for entry in fs::read_dir(cards_dir)? {
        let path = entry?.path();
        if !path.extension().is_some_and(|e| e == "json") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<KnowledgeCard>(&content) {
            Ok(card) => cards.push(card),
            Err(e) => warn!("Skipping unreadable card file {:?}: {}", path, e),
        }
    }

    Ok(cards)
}

fn build_index(
    cards_dir: &Path,
    cards: Vec<KnowledgeCard>,
    embedder: &dyn Embedder,
) -> Result<(HashMap<String, KnowledgeCard>, FlatIndex)> {
    let mut index = FlatIndex::new(embedder.dimension());
    let mut table = HashMap::with_capacity(cards.len());

    for mut card in cards {
        let usable = card
            .embedding
            .as_deref()
            .is_some_and(|v| index.check_vector(v).is_ok());

        if !usable {
            debug!("Re-embedding card {}", card.card_id);
            card.embedding = Some(embedder.embed_document(&card.search_text())?);
            write_card(cards_dir, &card)?;
        }

        if let Some(vector) = card.embedding.clone() {
            index.insert(&card.card_id, vector)?;
        }
        table.insert(card.card_id.clone(), card);
    }

    Ok((table, index))
}
