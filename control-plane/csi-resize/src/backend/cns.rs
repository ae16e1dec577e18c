use super::{BackendVolume, BackingDetails, StorageBackend};
use crate::{error::Error, types::Attachment};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    time::Duration,
};
use tracing::{debug, instrument};

// REST API URI names for API objects.
mod uri {
    pub const VOLUMES: &str = "volumes";
    pub const CAPACITY: &str = "capacity";
}

/// Struct for representing URI.
#[derive(Debug)]
struct UrnType<'a>(&'a [&'a str]);

impl UrnType<'_> {
    /// The volume id this URI refers to.
    fn volume_id(&self) -> String {
        self.0.get(1).map(|id| id.to_string()).unwrap_or_default()
    }

    /// Transform URI into a full URL based on the given base URL.
    fn get_full_url(&self, base_url: &str) -> Result<Url, Error> {
        let url = format!("{base_url}/{self}");
        Url::parse(&url).map_err(|error| Error::InvalidArgument {
            message: format!("malformed URL '{url}': {error}"),
        })
    }
}

impl Display for UrnType<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Attachment as reported by CNS.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CnsAttachment {
    #[serde(default)]
    node: Option<String>,
}

/// Volume as reported by CNS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CnsVolume {
    volume_id: String,
    backing_object_details: BackingDetails,
    #[serde(default)]
    attachment: CnsAttachment,
}

impl From<CnsVolume> for BackendVolume {
    fn from(volume: CnsVolume) -> Self {
        Self {
            volume_id: volume.volume_id,
            backing: volume.backing_object_details,
            attachment: match volume.attachment.node {
                Some(node) if !node.is_empty() => Attachment::Attached { node },
                _ => Attachment::Detached,
            },
        }
    }
}

/// Body of the expand request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpandVolumeBody {
    capacity_in_mb: u64,
}

/// Client for a CNS REST gateway.
/// Encapsulates communication with the REST API by exposing the volume query and
/// expand operations, which perform (de)serialization of API request/response objects.
#[derive(Debug, Clone)]
pub struct CnsClient {
    base_url: String,
    rest_client: Client,
}

impl CnsClient {
    /// Create a client for the given endpoint.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        // Make sure endpoint is a well-formed URL.
        Url::parse(endpoint).map_err(|error| Error::InvalidArgument {
            message: format!("invalid CNS endpoint URL '{endpoint}': {error}"),
        })?;

        let rest_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| Error::Http {
                url: endpoint.to_string(),
                source,
            })?;

        debug!("CNS client is initialized with endpoint {}", endpoint);
        Ok(Self {
            base_url: format!("{}/v1", endpoint.trim_end_matches('/')),
            rest_client,
        })
    }

    // Map an unsuccessful HTTP status into our error taxonomy.
    fn status_error(urn: &UrnType<'_>, status: StatusCode, detail: String) -> Error {
        let volume = urn.volume_id();
        match status {
            StatusCode::NOT_FOUND => Error::VolumeNotFound { volume },
            StatusCode::BAD_REQUEST => Error::InvalidArgument { message: detail },
            StatusCode::CONFLICT => Error::OperationInProgress { id: volume },
            _ => Error::Backend {
                volume,
                message: format!("HTTP status {status}: {detail}"),
            },
        }
    }

    async fn check_response(
        &self,
        urn: &UrnType<'_>,
        response: Response,
    ) -> Result<Response, Error> {
        match response.status() {
            status if status.is_success() => Ok(response),
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Self::status_error(urn, status, detail))
            }
        }
    }

    async fn do_get<R>(&self, urn: &UrnType<'_>) -> Result<R, Error>
    where
        for<'a> R: Deserialize<'a>,
    {
        let url = urn.get_full_url(&self.base_url)?;
        let response = self
            .rest_client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.to_string(),
                source,
            })?;
        let response = self.check_response(urn, response).await?;

        let body = response.bytes().await.map_err(|source| Error::Http {
            url: url.to_string(),
            source,
        })?;
        decode_body::<R>(url.as_str(), &body)
    }

    async fn do_put<I>(&self, urn: &UrnType<'_>, object: &I) -> Result<(), Error>
    where
        I: Serialize + ?Sized,
    {
        let url = urn.get_full_url(&self.base_url)?;
        let response = self
            .rest_client
            .put(url.clone())
            .json(object)
            .send()
            .await
            .map_err(|source| Error::Http {
                url: url.to_string(),
                source,
            })?;
        self.check_response(urn, response).await.map(|_| ())
    }
}

fn decode_body<R>(url: &str, body: &[u8]) -> Result<R, Error>
where
    for<'a> R: Deserialize<'a>,
{
    serde_json::from_slice::<R>(body).map_err(|error| Error::InvalidResponse {
        url: url.to_string(),
        message: format!(
            "failed to deserialize object {}, error = {}",
            std::any::type_name::<R>(),
            error
        ),
    })
}

#[async_trait]
impl StorageBackend for CnsClient {
    #[instrument(level = "debug", skip(self))]
    async fn query_volume(&self, volume_id: &str) -> Result<BackendVolume, Error> {
        let volume: CnsVolume = self.do_get(&UrnType(&[uri::VOLUMES, volume_id])).await?;
        Ok(volume.into())
    }

    #[instrument(level = "debug", skip(self))]
    async fn expand_volume(&self, volume_id: &str, target_mb: u64) -> Result<(), Error> {
        self.do_put(
            &UrnType(&[uri::VOLUMES, volume_id, uri::CAPACITY]),
            &ExpandVolumeBody {
                capacity_in_mb: target_mb,
            },
        )
        .await
    }
}
