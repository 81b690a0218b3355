//! Remote Signing Service Client
//!
//! Talks to an external KMS/HSM-backed signing service over HTTP. Key
//! custody and rotation policy live entirely on the remote side.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::signatures::{EntrySignature, KeyVersion, SigningError, SigningService};

#[derive(Serialize)]
struct SignRequest<'a> {
    digest: &'a str,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    digest: &'a str,
    signature: &'a str,
    key_version: KeyVersion,
}

#[derive(Deserialize)]
struct SignResponse {
    key_version: KeyVersion,
    signature: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
}

#[derive(Deserialize)]
struct RotateResponse {
    key_version: KeyVersion,
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

/// HTTP client for the signing collaborator
pub struct RemoteSigner {
    base_url: String,
    http_client: Client,
}

impl RemoteSigner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SigningError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SigningError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, SigningError> {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(unavailable)?;
        decode(response).await
    }
}

async fn decode<R: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<R, SigningError> {
    let status = response.status();
    if status.is_client_error() {
        return Err(SigningError::Malformed(format!("signing service rejected request: {}", status)));
    }
    if !status.is_success() {
        warn!(status = %status, "signing service request failed");
        return Err(SigningError::Unavailable(format!("signing service returned {}", status)));
    }
    response
        .json::<R>()
        .await
        .map_err(|e| SigningError::Malformed(format!("invalid signing service response: {}", e)))
}

fn unavailable(err: reqwest::Error) -> SigningError {
    SigningError::Unavailable(format!("signing service unreachable: {}", err))
}

#[async_trait]
impl SigningService for RemoteSigner {
    async fn sign(&self, digest: &[u8]) -> Result<EntrySignature, SigningError> {
        let digest = hex::encode(digest);
        let response: SignResponse = self.post("/sign", &SignRequest { digest: &digest }).await?;
        let value = hex::decode(&response.signature)
            .map_err(|e| SigningError::Malformed(format!("signature is not hex: {}", e)))?;

        debug!(key_version = %response.key_version, "remote signature received");
        Ok(EntrySignature {
            key_version: response.key_version,
            value,
        })
    }

    async fn verify(
        &self,
        digest: &[u8],
        signature: &[u8],
        key_version: KeyVersion,
    ) -> Result<bool, SigningError> {
        let digest = hex::encode(digest);
        let signature = hex::encode(signature);
        let request = VerifyRequest {
            digest: &digest,
            signature: &signature,
            key_version,
        };
        let response: VerifyResponse = self.post("/verify", &request).await?;
        Ok(response.valid)
    }

    async fn rotate_key(&self) -> Result<KeyVersion, SigningError> {
        let response: RotateResponse = self.post("/rotate", &serde_json::json!({})).await?;
        Ok(response.key_version)
    }

    async fn public_key(&self, key_version: KeyVersion) -> Result<Vec<u8>, SigningError> {
        let response = self
            .http_client
            .get(self.url(&format!("/keys/{}", key_version.0)))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SigningError::UnknownKeyVersion(key_version));
        }
        let body: PublicKeyResponse = decode(response).await?;
        hex::decode(&body.public_key)
            .map_err(|e| SigningError::Malformed(format!("public key is not hex: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signer(server: &MockServer) -> RemoteSigner {
        RemoteSigner::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_remote_sign() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .and(body_json(json!({ "digest": "0101" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key_version": 4,
                "signature": "abcd"
            })))
            .mount(&server)
            .await;

        let signature = signer(&server).sign(&[1, 1]).await.unwrap();
        assert_eq!(signature.key_version, KeyVersion(4));
        assert_eq!(signature.value, vec![0xab, 0xcd]);
    }

    #[tokio::test]
    async fn test_remote_verify_and_rotate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "valid": false })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rotate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "key_version": 5 })))
            .mount(&server)
            .await;

        let signer = signer(&server);
        assert!(!signer.verify(&[1], &[2], KeyVersion(1)).await.unwrap());
        assert_eq!(signer.rotate_key().await.unwrap(), KeyVersion(5));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = signer(&server).sign(&[0; 32]).await;
        assert!(matches!(result, Err(SigningError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let signer = RemoteSigner::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(signer.sign(&[0; 32]).await, Err(SigningError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unknown_public_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = signer(&server).public_key(KeyVersion(7)).await;
        assert!(matches!(result, Err(SigningError::UnknownKeyVersion(KeyVersion(7)))));
    }
}
