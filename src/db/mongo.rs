//! MongoDB adapter.
//!
//! Queries are aggregation pipelines; the LLM output is accepted as raw
//! JSON or a fenced JSON block. Results are rewritten so ObjectId and
//! other binary types become strings for serialization safety.

use async_trait::async_trait;
use base64::Engine;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::Client;
use tracing::{debug, warn};

use crate::db::{wrong_variant, Adapter, BackendKind, Query, QueryOptions, Row};
use crate::error::{GatewayError, Result};
use crate::llm::LlmService;
use crate::schema::SchemaDocument;

/// Documents sampled per collection during introspection.
const SAMPLE_SIZE: i64 = 5;

/// Collections probed when list-collections privileges are missing.
const COMMON_COLLECTIONS: &[&str] = &[
    "users",
    "orders",
    "sample_orders",
    "products",
    "events",
    "sessions",
    "logs",
];

/// MongoDB adapter.
pub struct MongoAdapter {
    uri: String,
    client: Client,
    database: String,
    llm: LlmService,
}

impl MongoAdapter {
    /// Connects to the deployment named by the URI.
    ///
    /// The database is taken from the URI path, falling back to `test`.
    pub async fn connect(uri: &str, llm: LlmService) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| GatewayError::backend(format!("MongoDB connection failed: {e}")))?;

        let database = url::Url::parse(uri)
            .ok()
            .and_then(|u| {
                let path = u.path().trim_start_matches('/').to_string();
                if path.is_empty() {
                    None
                } else {
                    Some(path)
                }
            })
            .unwrap_or_else(|| "test".to_string());

        Ok(Self {
            uri: uri.to_string(),
            client,
            database,
            llm,
        })
    }

    fn db(&self) -> mongodb::Database {
        self.client.database(&self.database)
    }

    /// Parses the LLM's JSON answer into a pipeline query.
    fn parse_query_json(value: serde_json::Value, default_collection: &str) -> Result<Query> {
        let display = value.to_string();
        let collection = value
            .get("collection")
            .and_then(|c| c.as_str())
            .unwrap_or(default_collection)
            .to_string();
        let pipeline = value
            .get("pipeline")
            .and_then(|p| p.as_array())
            .cloned()
            .ok_or_else(|| GatewayError::query_invalid("missing 'pipeline' array", display))?;

        Ok(Query::MongoPipeline {
            collection,
            pipeline,
        })
    }

    /// Returns collection names, probing common names when the privilege
    /// for listCollections is missing.
    async fn collection_names(&self) -> Result<Vec<String>> {
        match self.db().list_collection_names().await {
            Ok(names) => Ok(names),
            Err(e) => {
                warn!(
                    "listCollections failed ({}), probing {} common names",
                    e,
                    COMMON_COLLECTIONS.len()
                );
                let mut found = Vec::new();
                for name in COMMON_COLLECTIONS {
                    let count = self
                        .db()
                        .collection::<Document>(name)
                        .estimated_document_count()
                        .await;
                    if matches!(count, Ok(n) if n > 0) {
                        found.push(name.to_string());
                    }
                }
                if found.is_empty() {
                    Err(GatewayError::PartialIntrospection(
                        "no collections visible and no common names matched".to_string(),
                    ))
                } else {
                    Ok(found)
                }
            }
        }
    }

    /// Samples documents from a collection to infer field types and
    /// example values.
    async fn describe_collection(&self, name: &str) -> Result<SchemaDocument> {
        let collection = self.db().collection::<Document>(name);
        let count = collection
            .estimated_document_count()
            .await
            .unwrap_or_default();

        let mut cursor = collection
            .find(doc! {})
            .limit(SAMPLE_SIZE)
            .await
            .map_err(|e| GatewayError::backend(format!("sample of '{name}' failed: {e}")))?;

        let mut fields: std::collections::BTreeMap<String, (String, String)> =
            std::collections::BTreeMap::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| GatewayError::backend(format!("cursor error on '{name}': {e}")))?
        {
            for (key, value) in document {
                fields.entry(key).or_insert_with(|| {
                    let type_name = bson_type_name(&value);
                    let example = render_example(&value);
                    (type_name.to_string(), example)
                });
            }
        }

        let mut content = format!("Collection: {name}\nEstimated documents: {count}\nFields:\n");
        for (field, (type_name, example)) in &fields {
            content.push_str(&format!("  - {field}: {type_name} (e.g. {example})\n"));
        }

        Ok(SchemaDocument::new(
            format!("collection:{name}"),
            content,
            "mongodb",
        ))
    }
}

#[async_trait]
impl Adapter for MongoAdapter {
    fn db_type(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    fn connection_uri(&self) -> &str {
        &self.uri
    }

    async fn llm_to_query(&self, nl_prompt: &str, opts: &QueryOptions) -> Result<Query> {
        let schema_context = match &opts.schema_chunks {
            Some(chunks) => chunks.clone(),
            None => match self.introspect_schema().await {
                Ok(documents) => documents
                    .iter()
                    .map(|d| d.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => {
                    warn!("schema unavailable for prompt context: {}", e);
                    String::from("(collections unavailable)")
                }
            },
        };

        let default_collection = opts.collection.as_deref().unwrap_or("sample_orders");
        let value = self
            .llm
            .generate_mongodb_query(nl_prompt, &schema_context, default_collection)
            .await?;
        Self::parse_query_json(value, default_collection)
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let Query::MongoPipeline {
            collection,
            pipeline,
        } = query
        else {
            return Err(wrong_variant(BackendKind::MongoDb, query));
        };

        let stages: Vec<Document> = pipeline
            .iter()
            .map(|stage| {
                mongodb::bson::to_document(stage).map_err(|e| {
                    GatewayError::query_invalid(
                        format!("invalid pipeline stage: {e}"),
                        query.display(),
                    )
                })
            })
            .collect::<Result<_>>()?;

        debug!(
            "Executing aggregation on '{}' with {} stages",
            collection,
            stages.len()
        );

        let mut cursor = self
            .db()
            .collection::<Document>(collection)
            .aggregate(stages)
            .await
            .map_err(|e| GatewayError::backend(format!("aggregation failed: {e}")))?;

        let mut rows = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| GatewayError::backend(format!("cursor error: {e}")))?
        {
            rows.push(document_to_row(document));
        }
        Ok(rows)
    }

    async fn introspect_schema(&self) -> Result<Vec<SchemaDocument>> {
        let names = self.collection_names().await?;
        let mut documents = Vec::with_capacity(names.len());
        let mut failures = Vec::new();

        for name in &names {
            match self.describe_collection(name).await {
                Ok(document) => documents.push(document),
                Err(e) => failures.push(format!("{name}: {e}")),
            }
        }

        if documents.is_empty() && !failures.is_empty() {
            return Err(GatewayError::PartialIntrospection(failures.join("; ")));
        }
        if !failures.is_empty() {
            warn!("partial introspection: {}", failures.join("; "));
        }
        Ok(documents)
    }

    async fn test_connection(&self) -> bool {
        self.db().run_command(doc! {"ping": 1}).await.is_ok()
    }
}

/// Converts a BSON document to a JSON row, stringifying binary types.
fn document_to_row(document: Document) -> Row {
    let mut row = Row::new();
    for (key, value) in document {
        row.insert(key, bson_to_json(value));
    }
    row
}

/// Converts a BSON value to JSON with serialization-safe scalars.
fn bson_to_json(value: Bson) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(
            dt.try_to_rfc3339_string()
                .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        ),
        Bson::Binary(bin) => Value::String(base64::engine::general_purpose::STANDARD.encode(bin.bytes)),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Document(document) => {
            Value::Object(document.into_iter().map(|(k, v)| (k, bson_to_json(v))).collect())
        }
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::from(i),
        Bson::Int64(i) => Value::from(i),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::Null => Value::Null,
        other => other.into_relaxed_extjson(),
    }
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Binary(_) => "binary",
        Bson::Decimal128(_) => "decimal",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::String(_) => "string",
        Bson::Boolean(_) => "bool",
        Bson::Int32(_) | Bson::Int64(_) => "int",
        Bson::Double(_) => "double",
        Bson::Null => "null",
        _ => "other",
    }
}

fn render_example(value: &Bson) -> String {
    let rendered = bson_to_json(value.clone()).to_string();
    if rendered.len() > 60 {
        let mut cut = 57;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &rendered[..cut])
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    #[test]
    fn test_parse_query_json_full() {
        let value = json!({
            "collection": "sample_orders",
            "pipeline": [
                {"$group": {"_id": "$user_id", "n": {"$sum": 1}}},
                {"$sort": {"n": -1}},
                {"$limit": 5}
            ]
        });
        let query = MongoAdapter::parse_query_json(value, "fallback").unwrap();
        match query {
            Query::MongoPipeline {
                collection,
                pipeline,
            } => {
                assert_eq!(collection, "sample_orders");
                assert_eq!(pipeline.len(), 3);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_query_json_defaults_collection() {
        let value = json!({"pipeline": []});
        let query = MongoAdapter::parse_query_json(value, "sample_orders").unwrap();
        match query {
            Query::MongoPipeline { collection, .. } => assert_eq!(collection, "sample_orders"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_query_json_missing_pipeline_fails() {
        let value = json!({"collection": "orders"});
        let err = MongoAdapter::parse_query_json(value, "x").unwrap_err();
        assert_eq!(err.kind(), "QueryInvalid");
    }

    #[test]
    fn test_object_id_becomes_string() {
        let oid = ObjectId::new();
        let mut document = Document::new();
        document.insert("_id", Bson::ObjectId(oid));
        document.insert("total", Bson::Double(12.5));

        let row = document_to_row(document);
        assert_eq!(row["_id"], json!(oid.to_hex()));
        assert_eq!(row["total"], json!(12.5));
    }

    #[test]
    fn test_binary_becomes_base64() {
        let mut document = Document::new();
        document.insert(
            "blob",
            Bson::Binary(mongodb::bson::Binary {
                subtype: mongodb::bson::spec::BinarySubtype::Generic,
                bytes: vec![1, 2, 3],
            }),
        );
        let row = document_to_row(document);
        assert_eq!(row["blob"], json!("AQID"));
    }

    #[test]
    fn test_nested_document_conversion() {
        let mut inner = Document::new();
        inner.insert("oid", Bson::ObjectId(ObjectId::new()));
        let mut document = Document::new();
        document.insert("nested", Bson::Document(inner));
        document.insert("tags", Bson::Array(vec![Bson::String("a".into())]));

        let row = document_to_row(document);
        assert!(row["nested"]["oid"].is_string());
        assert_eq!(row["tags"], json!(["a"]));
    }

    #[test]
    fn test_bson_type_names() {
        assert_eq!(bson_type_name(&Bson::Int64(1)), "int");
        assert_eq!(bson_type_name(&Bson::String("x".into())), "string");
        assert_eq!(bson_type_name(&Bson::ObjectId(ObjectId::new())), "objectId");
    }
}
