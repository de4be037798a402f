//! National subway station registry (MOLIT `SubwayInfoService`).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value as JsonValue;
use transit_core::{RawStationObservation, SourceClass, SourceTag};
use tracing::debug;
use transit_storage::HttpFetcher;

use crate::{parse_numeric, parse_text, AdapterError, DetailSource};

const SEARCH_PATH: &str = "SubwayInfoService/getKwrdFndSubwaySttnList";
const ROWS_PER_LOOKUP: &str = "100";

pub struct MolitDetailClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    service_key: Option<String>,
}

impl MolitDetailClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        service_key: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_key: service_key.filter(|k| !k.trim().is_empty()),
        }
    }

    /// URL without the service key. The key is appended verbatim because the
    /// portal hands it out already percent-encoded.
    fn search_url(&self, name: &str) -> Result<Url, AdapterError> {
        Url::parse_with_params(
            &format!("{}/{SEARCH_PATH}", self.base_url),
            &[
                ("pageNo", "1"),
                ("numOfRows", ROWS_PER_LOOKUP),
                ("_type", "json"),
                ("subwayStationName", name),
            ],
        )
        .map_err(|err| AdapterError::Message(format!("building MOLIT url: {err}")))
    }
}

#[async_trait]
impl DetailSource for MolitDetailClient {
    fn source_id(&self) -> &'static str {
        "molit"
    }

    fn is_configured(&self) -> bool {
        self.service_key.is_some()
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Vec<RawStationObservation>, AdapterError> {
        let Some(key) = &self.service_key else {
            return Ok(Vec::new());
        };
        let url = self.search_url(name)?;
        let log_url = url.to_string();
        let full_url = format!("{log_url}&serviceKey={key}");
        let body: JsonValue = self
            .http
            .fetch_json(SourceClass::DetailRegistry, &full_url, &log_url)
            .await?;
        parse_molit_response(&body)
    }
}

/// Extracts observations from `response.body.items.item`, which the API sends
/// as an array, a single object, or an empty string when nothing matched.
pub fn parse_molit_response(body: &JsonValue) -> Result<Vec<RawStationObservation>, AdapterError> {
    if let Some(code) = body
        .pointer("/response/header/resultCode")
        .and_then(|v| parse_text(Some(v)))
    {
        if code != "00" && code != "0" {
            let message = body
                .pointer("/response/header/resultMsg")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            return Err(AdapterError::Malformed {
                source_id: "molit",
                detail: format!("result code {code} {message}").trim().to_string(),
            });
        }
    }

    let items = match body.pointer("/response/body/items/item") {
        Some(JsonValue::Array(items)) => items.iter().collect(),
        Some(item @ JsonValue::Object(_)) => vec![item],
        _ => Vec::new(),
    };

    Ok(items.into_iter().filter_map(observation_from_item).collect())
}

fn observation_from_item(item: &JsonValue) -> Option<RawStationObservation> {
    let Some(name) = parse_text(item.get("subwayStationName")) else {
        debug!(source = "molit", "skipping item without a station name");
        return None;
    };
    let route = parse_text(item.get("subwayRouteName")).unwrap_or_default();
    let mut observation = RawStationObservation::new(name, route, SourceTag::DetailRegistry);
    if let Some(id) = parse_text(item.get("subwayStationId")) {
        observation = observation.with_station_id(id);
    }
    if let Some(region) = parse_text(item.get("sidoName")) {
        observation = observation.with_region(region, parse_text(item.get("sggName")));
    } else {
        observation.city_hint = parse_text(item.get("sggName"));
    }
    if let Some(address) = parse_text(item.get("roadAddress")) {
        observation = observation.with_address(address);
    }
    if let (Some(lat), Some(lon)) = (
        parse_numeric(item.get("lat")),
        parse_numeric(item.get("lon")),
    ) {
        observation = observation.with_coordinate(lat, lon);
    }
    Some(observation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use transit_storage::HttpClientConfig;

    #[test]
    fn item_may_be_array_object_or_empty() {
        let array = json!({"response": {"header": {"resultCode": "00"}, "body": {"items": {"item": [
            {"subwayStationId": "MTRS11133", "subwayStationName": "City Hall", "subwayRouteName": "Seoul Line 1",
             "sidoName": "Seoul", "sggName": "Jung-gu", "lat": "37.5657", "lon": "126.9769"},
            {"subwayStationId": "DJR1", "subwayStationName": "City Hall", "subwayRouteName": "Daejeon Line 1",
             "sidoName": "Daejeon", "sggName": "Seo-gu", "lat": 36.3504, "lon": 127.3845}
        ]}}}});
        let single = json!({"response": {"body": {"items": {"item":
            {"subwayStationName": "Gongdeok", "subwayRouteName": "Line 6", "roadAddress": "Mapo-daero 100"}
        }}}});
        let empty = json!({"response": {"body": {"items": ""}}});

        let parsed = parse_molit_response(&array).expect("array");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].region_hint.as_deref(), Some("Daejeon"));
        assert_eq!(parsed[1].city_hint.as_deref(), Some("Seo-gu"));
        assert!(parsed.iter().all(|o| o.coordinate.is_some()));

        let parsed = parse_molit_response(&single).expect("single");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].address.as_deref(), Some("Mapo-daero 100"));
        assert!(parsed[0].coordinate.is_none());

        assert!(parse_molit_response(&empty).expect("empty").is_empty());
    }

    #[test]
    fn error_result_code_is_reported() {
        let body = json!({"response": {"header": {"resultCode": "30", "resultMsg": "SERVICE_KEY_IS_NOT_REGISTERED_ERROR"}}});
        assert!(parse_molit_response(&body).is_err());
    }

    #[test]
    fn search_url_encodes_station_name() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
        let client = MolitDetailClient::new(http, "https://apis.data.go.kr/1613000/", Some("k".into()));
        let url = client.search_url("시청").expect("url").to_string();
        assert!(url.starts_with("https://apis.data.go.kr/1613000/SubwayInfoService/getKwrdFndSubwaySttnList?"));
        assert!(url.contains("_type=json"));
        assert!(url.contains("subwayStationName=%EC%8B%9C%EC%B2%AD"));
        assert!(!url.contains("serviceKey"));
    }

    #[tokio::test]
    async fn unconfigured_client_short_circuits() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"));
        let client = MolitDetailClient::new(http, "http://127.0.0.1:9", None);
        assert!(!client.is_configured());
        assert!(client.lookup_by_name("Seoul").await.expect("lookup").is_empty());
    }
}
