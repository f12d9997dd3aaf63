//! CRM adapter speaking the JSON envelope protocol over HTTP.

use std::sync::Arc;

use async_trait::async_trait;
use crmsync_core::{FieldDefinition, FieldType, RawRecord};
use crmsync_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info_span;
use tracing::Instrument;

use crate::{CrmError, CrmSource, QueryResult, QuerySpec, TokenProvider};

pub struct HttpCrmSource {
    base_url: String,
    http: HttpFetcher,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireField {
    api_name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    is_required: bool,
}

#[derive(Debug, Deserialize)]
struct WireFields {
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQuery {
    #[serde(default)]
    data_list: Vec<RawRecord>,
    #[serde(default)]
    total: Option<u64>,
}

impl HttpCrmSource {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            tokens,
        }
    }

    async fn call(&self, path: &str, body: JsonValue) -> Result<JsonValue, CrmError> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post_json(&url, Some(&token), &body)
            .await
            .map_err(map_fetch_error)?;
        decode_envelope(resp.body)
    }
}

fn map_fetch_error(err: FetchError) -> CrmError {
    if err.is_auth_rejection() {
        return CrmError::Credential(err.to_string());
    }
    match err.disposition() {
        RetryDisposition::Retryable => CrmError::Transient(err.to_string()),
        RetryDisposition::NonRetryable => CrmError::Rejected(err.to_string()),
    }
}

pub(crate) fn decode_envelope(body: JsonValue) -> Result<JsonValue, CrmError> {
    let envelope: Envelope =
        serde_json::from_value(body).map_err(|e| CrmError::Decode(e.to_string()))?;
    if envelope.code != 0 {
        return Err(CrmError::Rejected(format!(
            "code {}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope.data)
}

pub(crate) fn decode_fields(data: JsonValue) -> Result<Vec<FieldDefinition>, CrmError> {
    let wire: WireFields = serde_json::from_value(data).map_err(|e| CrmError::Decode(e.to_string()))?;
    Ok(wire
        .fields
        .into_iter()
        .map(|f| {
            let field_type = FieldType::parse(&f.field_type);
            let display_name = f.label.unwrap_or_else(|| f.api_name.clone());
            let mut def = FieldDefinition::new(f.api_name, display_name, field_type);
            def.is_required = f.is_required;
            def
        })
        .collect())
}

pub(crate) fn decode_query(data: JsonValue) -> Result<QueryResult, CrmError> {
    let wire: WireQuery = serde_json::from_value(data).map_err(|e| CrmError::Decode(e.to_string()))?;
    Ok(QueryResult {
        records: wire.data_list,
        total: wire.total,
    })
}

#[async_trait]
impl CrmSource for HttpCrmSource {
    async fn list_fields(&self, object_api_name: &str) -> Result<Vec<FieldDefinition>, CrmError> {
        let data = self
            .call("/v1/objects/describe", json!({ "objectApiName": object_api_name }))
            .instrument(info_span!("crm_describe", object = object_api_name))
            .await?;
        decode_fields(data)
    }

    async fn query_records(
        &self,
        object_api_name: &str,
        query: &QuerySpec,
    ) -> Result<QueryResult, CrmError> {
        let body = json!({
            "objectApiName": object_api_name,
            "filters": query.filters,
            "offset": query.offset,
            "limit": query.limit,
        });
        let data = self
            .call("/v1/objects/query", body)
            .instrument(info_span!(
                "crm_query",
                object = object_api_name,
                offset = query.offset,
                limit = query.limit
            ))
            .await?;
        decode_query(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_zero_envelope_code_is_rejected() {
        let err = decode_envelope(json!({"code": 10006, "message": "object not found", "data": null}))
            .unwrap_err();
        assert!(matches!(err, CrmError::Rejected(msg) if msg.contains("10006")));
    }

    #[test]
    fn describe_payload_maps_field_types() {
        let data = decode_envelope(json!({
            "code": 0,
            "data": {"fields": [
                {"apiName": "name", "label": "Name", "type": "text", "isRequired": true},
                {"apiName": "owner", "label": "Owner", "type": "object_reference"},
                {"apiName": "tags", "type": "select_many"}
            ]}
        }))
        .unwrap();
        let fields = decode_fields(data).unwrap();
        assert_eq!(fields.len(), 3);
        assert!(fields[0].is_required);
        assert!(fields[1].is_relation);
        assert_eq!(fields[2].field_type, FieldType::MultiSelect);
        assert_eq!(fields[2].display_name, "tags");
    }

    #[test]
    fn query_payload_carries_total_when_present() {
        let result = decode_query(json!({
            "dataList": [{"_id": "a"}, {"_id": "b"}],
            "total": 25
        }))
        .unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.total, Some(25));

        let result = decode_query(json!({"dataList": []})).unwrap();
        assert!(result.total.is_none());
    }

    #[test]
    fn auth_statuses_become_credential_errors() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 403,
            url: "http://crm".into(),
        });
        assert!(matches!(err, CrmError::Credential(_)));
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 429,
            url: "http://crm".into(),
        });
        assert!(matches!(err, CrmError::Transient(_)));
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 400,
            url: "http://crm".into(),
        });
        assert!(matches!(err, CrmError::Rejected(_)));
    }
}
