use std::collections::BTreeMap;

use reqwest::{Client, Request, Response};
use serde_json::Value;

use crate::interceptors::{TapKind, TapRegistry};
use crate::types::{NetworkRequestRecord, RequestKind, RequestStatus};

/// HTTP client whose requests are reported to the fetch tap while it is
/// installed. With no tap installed it is a plain pass-through.
#[derive(Clone)]
pub struct MonitoredClient {
    client: Client,
    taps: TapRegistry,
}

impl MonitoredClient {
    pub fn new(taps: TapRegistry) -> Self {
        Self::with_client(Client::new(), taps)
    }

    pub fn with_client(client: Client, taps: TapRegistry) -> Self {
        Self { client, taps }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn get(&self, url: &str) -> Result<Response, reqwest::Error> {
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }

    pub async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        if !self.taps.is_tapped(TapKind::Fetch) {
            return self.client.execute(request).await;
        }

        let mut record = start_record(&request);
        self.taps.report(TapKind::Fetch, record.clone());

        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                record.status_code = Some(status.as_u16());
                record.response_size = response.content_length();
                record.finish(if status.is_success() {
                    RequestStatus::Success
                } else {
                    RequestStatus::Error
                });
                self.taps.report(TapKind::Fetch, record);
                Ok(response)
            }
            Err(e) => {
                record.error = Some(e.to_string());
                record.finish(RequestStatus::Error);
                self.taps.report(TapKind::Fetch, record);
                Err(e)
            }
        }
    }
}

fn start_record(request: &Request) -> NetworkRequestRecord {
    let mut record = NetworkRequestRecord::started(
        RequestKind::Fetch,
        request.method().as_str(),
        request.url().as_str(),
    );
    record.request_headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect::<BTreeMap<_, _>>();

    if request.url().path().ends_with("/graphql") {
        record.kind = RequestKind::Graphql;
        record.operation_name = request
            .body()
            .and_then(|body| body.as_bytes())
            .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
            .and_then(|body| body.get("operationName")?.as_str().map(String::from));
    }

    record
}
