//! Search: the ANN Index plus keyword search and hybrid fusion helpers used
//! by the Retrieval Pipeline.

mod ann;
mod hybrid;
mod keyword;

pub use ann::{
    VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError, DEFAULT_CONNECTIVITY,
    DEFAULT_DIMENSIONS, DEFAULT_EXPANSION_ADD, DEFAULT_EXPANSION_SEARCH,
};

pub use hybrid::{linear_combination, reciprocal_rank_fusion, HybridSearchConfig, HybridSearcher};

pub use keyword::{sanitize_fts5_query, tokenize, KeywordIndex};
