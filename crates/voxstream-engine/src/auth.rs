use crate::credentials::Credential;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use voxstream_core::CredentialError;

pub const SPEECH_AUDIENCE: &str = "https://speech.googleapis.com/";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const JWT_LIFETIME: Duration = Duration::from_secs(3600);
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeyFile {
    ServiceAccount {
        client_email: String,
        private_key_id: String,
        private_key: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Produces bearer tokens for the recognize call.
pub enum TokenSource {
    /// Self-signed JWT access token; no network round trip.
    ServiceAccount {
        client_email: String,
        key_id: String,
        key: EncodingKey,
        audience: String,
    },
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        http: reqwest::Client,
    },
    Metadata {
        host: String,
        http: reqwest::Client,
    },
}

impl TokenSource {
    /// Interpret credential material. Fails on key files that are not JSON,
    /// carry an unknown `type`, or hold an unusable private key.
    pub fn from_credential(credential: &Credential, audience: &str) -> Result<Self, CredentialError> {
        match credential {
            Credential::KeyMaterial { bytes, .. } => {
                let key: KeyFile = serde_json::from_slice(bytes)
                    .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
                match key {
                    KeyFile::ServiceAccount {
                        client_email,
                        private_key_id,
                        private_key,
                    } => {
                        let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
                            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
                        Ok(TokenSource::ServiceAccount {
                            client_email,
                            key_id: private_key_id,
                            key,
                            audience: audience.to_string(),
                        })
                    }
                    KeyFile::AuthorizedUser {
                        client_id,
                        client_secret,
                        refresh_token,
                    } => Ok(TokenSource::RefreshToken {
                        client_id,
                        client_secret,
                        refresh_token,
                        http: reqwest::Client::new(),
                    }),
                }
            }
            Credential::MetadataServer { host } => Ok(TokenSource::Metadata {
                host: host.clone(),
                http: reqwest::Client::new(),
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TokenSource::ServiceAccount { .. } => "service_account",
            TokenSource::RefreshToken { .. } => "authorized_user",
            TokenSource::Metadata { .. } => "metadata",
        }
    }

    // TODO: cache OAuth access tokens until expiry instead of fetching one per stream.
    pub async fn access_token(&self) -> Result<String, CredentialError> {
        match self {
            TokenSource::ServiceAccount {
                client_email,
                key_id,
                key,
                audience,
            } => {
                let iat = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| CredentialError::Token(e.to_string()))?
                    .as_secs();
                let claims = JwtClaims {
                    iss: client_email,
                    sub: client_email,
                    aud: audience,
                    iat,
                    exp: iat + JWT_LIFETIME.as_secs(),
                };
                let header = Header {
                    kid: Some(key_id.clone()),
                    ..Header::new(Algorithm::RS256)
                };
                jsonwebtoken::encode(&header, &claims, key)
                    .map_err(|e| CredentialError::Token(e.to_string()))
            }
            TokenSource::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                http,
            } => {
                let form = [
                    ("grant_type", "refresh_token"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                ];
                let response = http
                    .post(OAUTH_TOKEN_URL)
                    .form(&form)
                    .timeout(TOKEN_REQUEST_TIMEOUT)
                    .send()
                    .await;
                fetch_token(response).await
            }
            TokenSource::Metadata { host, http } => {
                let response = http
                    .get(format!(
                        "{host}/computeMetadata/v1/instance/service-accounts/default/token"
                    ))
                    .header("Metadata-Flavor", "Google")
                    .timeout(TOKEN_REQUEST_TIMEOUT)
                    .send()
                    .await;
                fetch_token(response).await
            }
        }
    }
}

async fn fetch_token(
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<String, CredentialError> {
    let response = response
        .and_then(|r| r.error_for_status())
        .map_err(|e| CredentialError::Token(e.to_string()))?;
    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| CredentialError::Token(e.to_string()))?;
    Ok(token.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialOrigin;
    use std::path::PathBuf;

    fn key_material(json: &str) -> Credential {
        Credential::KeyMaterial {
            bytes: json.as_bytes().to_vec(),
            origin: CredentialOrigin::KeyPath(PathBuf::from("/k.json")),
        }
    }

    #[test]
    fn test_authorized_user_key_parses() {
        let credential = key_material(
            r#"{"type":"authorized_user","client_id":"id","client_secret":"s","refresh_token":"r"}"#,
        );
        let source = TokenSource::from_credential(&credential, SPEECH_AUDIENCE).unwrap();
        assert_eq!(source.kind(), "authorized_user");
    }

    #[test]
    fn test_metadata_credential_maps_to_metadata_source() {
        let credential = Credential::MetadataServer {
            host: "http://metadata.google.internal".to_string(),
        };
        let source = TokenSource::from_credential(&credential, SPEECH_AUDIENCE).unwrap();
        assert_eq!(source.kind(), "metadata");
    }

    #[test]
    fn test_non_json_key_is_invalid() {
        let result = TokenSource::from_credential(&key_material("not json"), SPEECH_AUDIENCE);
        assert!(matches!(result, Err(CredentialError::InvalidKey(_))));
    }

    #[test]
    fn test_unknown_key_type_is_invalid() {
        let result = TokenSource::from_credential(
            &key_material(r#"{"type":"external_account"}"#),
            SPEECH_AUDIENCE,
        );
        assert!(matches!(result, Err(CredentialError::InvalidKey(_))));
    }

    #[test]
    fn test_service_account_with_bad_pem_is_invalid() {
        let result = TokenSource::from_credential(
            &key_material(
                r#"{"type":"service_account","client_email":"a@b","private_key_id":"k","private_key":"nope"}"#,
            ),
            SPEECH_AUDIENCE,
        );
        assert!(matches!(result, Err(CredentialError::InvalidKey(_))));
    }
}
