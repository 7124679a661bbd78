//! Vector search gateway.
//!
//! Named collections of embeddings with per-collection dimensionality,
//! distance metric, and index parameters. A collection is provisioned
//! once from a [`CollectionSpec`] and is immutable afterwards;
//! changing the spec means recreating the collection. Upserts and
//! queries are checked against the spec and fail with a schema
//! mismatch rather than letting the store reject them mid-flight.
//!
//! Collections live in pgvector-backed tables, one per collection,
//! with an HNSW index built from the spec's edges-per-node and
//! construction-quality parameters. Queries order by the collection's
//! metric with insertion order as the tie-break, so results are
//! deterministic for a fixed dataset.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use pgvector::Vector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::error::{DataError, Result};
use crate::pool::PoolManager;

const MAX_DIMENSION: u32 = 16_000;
const MAX_K: usize = 1_000;

/// Distance metric of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    L2,
    InnerProduct,
}

impl DistanceMetric {
    /// The pgvector distance operator.
    fn operator(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "<=>",
            DistanceMetric::L2 => "<->",
            DistanceMetric::InnerProduct => "<#>",
        }
    }

    /// The operator class the index is built with.
    fn opclass(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vector_cosine_ops",
            DistanceMetric::L2 => "vector_l2_ops",
            DistanceMetric::InnerProduct => "vector_ip_ops",
        }
    }

    /// Similarity score, larger is closer: cosine similarity, negated
    /// L2 distance, or inner product (the `<#>` operator returns the
    /// negated product, so negating it again yields the product).
    fn score_expr(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "(1 - (embedding <=> $1))::float8",
            DistanceMetric::L2 => "(-(embedding <-> $1))::float8",
            DistanceMetric::InnerProduct => "(-(embedding <#> $1))::float8",
        }
    }
}

/// Where a collection's segments live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Unlogged storage: fast, rebuilt from source data after a crash.
    InMemory,
    OnDisk,
}

/// Index construction parameters. Edges-per-node and construction
/// quality drive the HNSW index; the remaining knobs are carried in
/// the catalog for engines that honor them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub edges_per_node: u32,
    pub construction_quality: u32,
    pub full_scan_threshold: u32,
    pub segment_size: u32,
    pub indexing_threshold: u32,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            edges_per_node: 16,
            construction_quality: 64,
            full_scan_threshold: 1_000,
            segment_size: 100_000,
            indexing_threshold: 10_000,
        }
    }
}

/// Immutable description of one vector collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: u32,
    pub metric: DistanceMetric,
    #[serde(default = "default_tier")]
    pub tier: StorageTier,
    #[serde(default)]
    pub index: IndexParams,
}

fn default_tier() -> StorageTier {
    StorageTier::OnDisk
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, dimension: u32, metric: DistanceMetric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
            tier: StorageTier::OnDisk,
            index: IndexParams::default(),
        }
    }

    pub fn with_tier(mut self, tier: StorageTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_index(mut self, index: IndexParams) -> Self {
        self.index = index;
        self
    }

    /// Collection names become table names, so they are restricted to
    /// lowercase identifiers.
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        let valid_name = !name.is_empty()
            && name.len() <= 48
            && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_name {
            return Err(DataError::validation(format!(
                "collection name {name:?} must be a lowercase identifier"
            )));
        }
        if self.dimension == 0 || self.dimension > MAX_DIMENSION {
            return Err(DataError::validation(format!(
                "collection dimension must be within 1..={MAX_DIMENSION}"
            )));
        }
        Ok(())
    }

    fn table(&self) -> String {
        format!("vec_{}", self.name)
    }

    fn index_name(&self) -> String {
        format!("vec_{}_embedding_idx", self.name)
    }

    fn table_ddl(&self) -> String {
        let unlogged = match self.tier {
            StorageTier::InMemory => "UNLOGGED ",
            StorageTier::OnDisk => "",
        };
        format!(
            "CREATE {unlogged}TABLE IF NOT EXISTS {table} (\
               id uuid PRIMARY KEY, \
               seq bigserial NOT NULL, \
               embedding vector({dim}) NOT NULL, \
               metadata jsonb NOT NULL DEFAULT '{{}}', \
               created_at timestamptz NOT NULL DEFAULT now()\
             )",
            table = self.table(),
            dim = self.dimension,
        )
    }

    fn index_ddl(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} \
             USING hnsw (embedding {opclass}) \
             WITH (m = {m}, ef_construction = {efc})",
            index = self.index_name(),
            table = self.table(),
            opclass = self.metric.opclass(),
            m = self.index.edges_per_node,
            efc = self.index.construction_quality,
        )
    }
}

/// The collections the operations agent runs with out of the box.
pub fn default_collections(dimension: u32) -> Vec<CollectionSpec> {
    ["code", "docs", "conversation", "incident_knowledge"]
        .into_iter()
        .map(|name| CollectionSpec::new(name, dimension, DistanceMetric::Cosine))
        .collect()
}

/// One similarity match, nearest first.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub score: f64,
    pub metadata: serde_json::Value,
}

/// Gateway over the vector store. Holds the provisioned specs so
/// dimension and existence checks never need a round trip.
pub struct VectorGateway {
    pools: Arc<PoolManager>,
    breaker: Arc<CircuitBreaker>,
    specs: RwLock<HashMap<String, CollectionSpec>>,
}

impl VectorGateway {
    pub fn new(pools: Arc<PoolManager>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            pools,
            breaker,
            specs: RwLock::new(HashMap::new()),
        }
    }

    fn spec(&self, collection: &str) -> Result<CollectionSpec> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
            .ok_or_else(|| {
                DataError::SchemaMismatch(format!("collection {collection:?} is not provisioned"))
            })
    }

    fn remember(&self, spec: CollectionSpec) {
        self.specs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec.name.clone(), spec);
    }

    /// Every provisioned spec, for introspection.
    pub fn specs(&self) -> Vec<CollectionSpec> {
        self.specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Load previously provisioned collections from the catalog.
    pub async fn load(&self) -> Result<usize> {
        let rows = self
            .breaker
            .execute(|| async {
                let conn = self.pools.vector().await?;
                conn.batch_execute(
                    "CREATE TABLE IF NOT EXISTS vector_collections (\
                       name text PRIMARY KEY, \
                       spec jsonb NOT NULL, \
                       created_at timestamptz NOT NULL DEFAULT now()\
                     )",
                )
                .await?;
                conn.query("SELECT spec FROM vector_collections", &[])
                    .await
                    .map_err(DataError::from)
            })
            .await?;

        let mut loaded = 0;
        for row in rows {
            let raw: serde_json::Value = row.get("spec");
            let spec: CollectionSpec = serde_json::from_value(raw)?;
            self.remember(spec);
            loaded += 1;
        }
        debug!(loaded, "vector collections loaded from catalog");
        Ok(loaded)
    }

    /// Provision a collection. Idempotent for an identical spec;
    /// a different spec under the same name is a schema mismatch,
    /// since provisioned collections are immutable.
    pub async fn provision(&self, spec: CollectionSpec) -> Result<()> {
        spec.validate()?;

        if let Ok(existing) = self.spec(&spec.name) {
            if existing == spec {
                return Ok(());
            }
            return Err(DataError::SchemaMismatch(format!(
                "collection {:?} is already provisioned with a different spec",
                spec.name
            )));
        }

        let spec_json = serde_json::to_value(&spec)?;
        self.breaker
            .execute(|| async {
                let conn = self.pools.vector().await?;
                conn.batch_execute(&spec.table_ddl()).await?;
                conn.batch_execute(&spec.index_ddl()).await?;
                conn.execute(
                    "INSERT INTO vector_collections (name, spec) VALUES ($1, $2) \
                     ON CONFLICT (name) DO NOTHING",
                    &[&spec.name, &spec_json],
                )
                .await?;
                Ok(())
            })
            .await?;

        info!(collection = %spec.name, dimension = spec.dimension, "vector collection provisioned");
        self.remember(spec);
        Ok(())
    }

    /// Insert or replace one embedding. Replacing keeps the original
    /// insertion order, so query tie-breaks stay stable.
    pub async fn upsert(
        &self,
        collection: &str,
        id: Uuid,
        vector: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let spec = self.spec(collection)?;
        ensure_dimension(&spec, vector.len())?;

        let embedding = Vector::from(vector);
        let sql = format!(
            "INSERT INTO {table} (id, embedding, metadata) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET \
               embedding = EXCLUDED.embedding, metadata = EXCLUDED.metadata",
            table = spec.table(),
        );
        self.breaker
            .execute(|| async {
                let conn = self.pools.vector().await?;
                conn.execute(sql.as_str(), &[&id, &embedding, &metadata])
                    .await?;
                Ok(())
            })
            .await
    }

    /// K-nearest-neighbour query, nearest first by the collection's
    /// metric, with an optional JSONB containment filter on metadata.
    pub async fn query(
        &self,
        collection: &str,
        vector: Vec<f32>,
        k: usize,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<SearchHit>> {
        let spec = self.spec(collection)?;
        ensure_dimension(&spec, vector.len())?;
        if k == 0 || k > MAX_K {
            return Err(DataError::validation(format!("k must be within 1..={MAX_K}")));
        }

        let embedding = Vector::from(vector);
        let sql = query_sql(&spec, k, filter.is_some());
        let rows = self
            .breaker
            .execute(|| async {
                let conn = self.pools.vector().await?;
                let rows = match &filter {
                    Some(filter) => conn.query(sql.as_str(), &[&embedding, filter]).await?,
                    None => conn.query(sql.as_str(), &[&embedding]).await?,
                };
                Ok(rows)
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| SearchHit {
                id: row.get("id"),
                score: row.get("score"),
                metadata: row.get("metadata"),
            })
            .collect())
    }
}

fn ensure_dimension(spec: &CollectionSpec, len: usize) -> Result<()> {
    if len != spec.dimension as usize {
        return Err(DataError::SchemaMismatch(format!(
            "collection {:?} expects dimension {}, got {len}",
            spec.name, spec.dimension,
        )));
    }
    Ok(())
}

fn query_sql(spec: &CollectionSpec, k: usize, filtered: bool) -> String {
    let filter_clause = if filtered {
        "WHERE metadata @> $2 "
    } else {
        ""
    };
    format!(
        "SELECT id, metadata, {score} AS score FROM {table} \
         {filter_clause}\
         ORDER BY embedding {op} $1, seq LIMIT {k}",
        score = spec.metric.score_expr(),
        table = spec.table(),
        op = spec.metric.operator(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_restricted_to_identifiers() {
        assert!(CollectionSpec::new("incident_knowledge", 1536, DistanceMetric::Cosine)
            .validate()
            .is_ok());

        for bad in ["", "Docs", "docs-v2", "1docs", "docs; DROP TABLE users"] {
            let err = CollectionSpec::new(bad, 1536, DistanceMetric::Cosine)
                .validate()
                .expect_err("invalid name rejected");
            assert!(matches!(err, DataError::Validation(_)), "{bad:?}");
        }
    }

    #[test]
    fn dimension_bounds_are_enforced() {
        assert!(CollectionSpec::new("docs", 0, DistanceMetric::L2).validate().is_err());
        assert!(
            CollectionSpec::new("docs", MAX_DIMENSION + 1, DistanceMetric::L2)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn index_ddl_carries_hnsw_parameters() {
        let spec = CollectionSpec::new("code", 1536, DistanceMetric::Cosine).with_index(
            IndexParams {
                edges_per_node: 32,
                construction_quality: 128,
                ..IndexParams::default()
            },
        );
        let ddl = spec.index_ddl();
        assert!(ddl.contains("USING hnsw"));
        assert!(ddl.contains("vector_cosine_ops"));
        assert!(ddl.contains("m = 32"));
        assert!(ddl.contains("ef_construction = 128"));
    }

    #[test]
    fn in_memory_tier_maps_to_unlogged_storage() {
        let spec = CollectionSpec::new("scratch", 8, DistanceMetric::L2)
            .with_tier(StorageTier::InMemory);
        assert!(spec.table_ddl().starts_with("CREATE UNLOGGED TABLE"));

        let spec = CollectionSpec::new("scratch", 8, DistanceMetric::L2);
        assert!(spec.table_ddl().starts_with("CREATE TABLE"));
    }

    #[test]
    fn mismatched_dimensions_are_a_schema_mismatch() {
        let spec = CollectionSpec::new("docs", 1536, DistanceMetric::Cosine);
        assert!(ensure_dimension(&spec, 1536).is_ok());

        let err = ensure_dimension(&spec, 768).expect_err("wrong dimension rejected");
        assert!(matches!(err, DataError::SchemaMismatch(_)));
    }

    #[test]
    fn query_orders_by_metric_with_insertion_tie_break() {
        let spec = CollectionSpec::new("docs", 3, DistanceMetric::Cosine);
        let sql = query_sql(&spec, 10, false);
        assert!(sql.contains("ORDER BY embedding <=> $1, seq"));
        assert!(sql.contains("LIMIT 10"));
        assert!(!sql.contains("WHERE"));

        let sql = query_sql(&spec, 5, true);
        assert!(sql.contains("WHERE metadata @> $2"));
    }

    #[test]
    fn scores_rank_larger_as_closer_per_metric() {
        assert_eq!(
            DistanceMetric::Cosine.score_expr(),
            "(1 - (embedding <=> $1))::float8"
        );
        assert_eq!(
            DistanceMetric::L2.score_expr(),
            "(-(embedding <-> $1))::float8"
        );
        assert_eq!(
            DistanceMetric::InnerProduct.score_expr(),
            "(-(embedding <#> $1))::float8"
        );
    }

    #[test]
    fn default_collections_cover_the_agent_domains() {
        let specs = default_collections(1536);
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["code", "docs", "conversation", "incident_knowledge"]);
        assert!(specs.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn specs_round_trip_through_the_catalog_shape() {
        let spec = CollectionSpec::new("docs", 1536, DistanceMetric::InnerProduct)
            .with_tier(StorageTier::InMemory);
        let json = serde_json::to_value(&spec).unwrap();
        let back: CollectionSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
