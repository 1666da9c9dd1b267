//! Upstream resolution: station id -> (auth token, playable stream URL).
//!
//! The session and the playback controller only see the two narrow traits
//! below; `RadikoResolver` is the HTTP implementation used by the binaries.
//!
//! ```text
//!   auth1  ── token + key offset/length ──┐
//!                                        ├─ partial key ── auth2 ── area check
//!   stream XML ── last playlist_create_url ── ?station_id=..&l=30&lsid=..&type=b
//! ```
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use rand::Rng;
use reqwest::Client;
use tracing::{debug, info, warn};

use radiko_proto::config::RadikoConfig;
use radiko_proto::protocol::{Station, AUTH_TOKEN_HEADER};

use crate::error::ResolveError;

/// Public key embedded in the HTML5 player; auth1 tells us which slice to send back.
const HTML5_AUTH_KEY: &str = "bcd151073c03b352e1ef2fd66c32209da9ca0afa";
const APP_NAME: &str = "pc_html5";
const APP_VERSION: &str = "0.0.1";
const DEVICE: &str = "pc";
const USER: &str = "dummy_user";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to start a transcoder for one station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub auth_token: String,
    pub stream_url: String,
}

/// Resolves a station into a fresh token + stream URL.  Called once per
/// session start and again on every reconnect.
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    async fn resolve(&self, station_id: &str) -> Result<ResolvedStream, ResolveError>;
}

/// Narrow capability used by the local player to refresh only the token.
#[async_trait]
pub trait Reauthenticator: Send + Sync {
    async fn reauthenticate(&self) -> Result<String, ResolveError>;
}

/// HTTP resolver talking to the radiko endpoints configured in `[radiko]`.
pub struct RadikoResolver {
    client: Client,
    config: RadikoConfig,
    area_id: Mutex<String>,
}

impl RadikoResolver {
    pub fn new(config: RadikoConfig) -> Result<Self, ResolveError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let area_id = Mutex::new(config.area_id.clone());
        Ok(Self {
            client,
            config,
            area_id,
        })
    }

    pub fn area_id(&self) -> String {
        self.area_id
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_area_id(&self, area_id: &str) {
        let mut guard = self.area_id.lock().unwrap_or_else(|p| p.into_inner());
        *guard = area_id.to_string();
    }

    /// Run the auth1/auth2 handshake and return the activated token.
    pub async fn authenticate(&self) -> Result<String, ResolveError> {
        let auth1_url = format!("{}/auth1", self.config.auth_url_base);
        let resp = self
            .client
            .get(&auth1_url)
            .header("X-Radiko-App", APP_NAME)
            .header("X-Radiko-App-Version", APP_VERSION)
            .header("X-Radiko-Device", DEVICE)
            .header("X-Radiko-User", USER)
            .send()
            .await?;
        check_status(&resp, &auth1_url)?;

        let token = header_str(&resp, AUTH_TOKEN_HEADER)?;
        let offset: usize = header_str(&resp, "X-Radiko-KeyOffset")?
            .parse()
            .map_err(|_| ResolveError::AuthFailed("invalid key offset".into()))?;
        let length: usize = header_str(&resp, "X-Radiko-KeyLength")?
            .parse()
            .map_err(|_| ResolveError::AuthFailed("invalid key length".into()))?;
        let partial = partial_key(offset, length)?;
        debug!("Auth1 ok (offset={}, length={})", offset, length);

        let auth2_url = format!("{}/auth2", self.config.auth_url_base);
        let resp = self
            .client
            .get(&auth2_url)
            .header(AUTH_TOKEN_HEADER, &token)
            .header("X-Radiko-Partialkey", partial)
            .header("X-Radiko-Device", DEVICE)
            .header("X-Radiko-User", USER)
            .send()
            .await?;
        check_status(&resp, &auth2_url)?;
        let body = resp.text().await?;
        let granted_area = body.split(',').next().unwrap_or("").trim().to_string();
        if granted_area.is_empty() {
            return Err(ResolveError::AuthFailed("auth2 returned no area".into()));
        }

        let wanted = self.area_id();
        if granted_area != wanted {
            warn!(
                "Token granted for area {} but {} is configured",
                granted_area, wanted
            );
        }
        info!("Authenticated (area {})", granted_area);
        Ok(token)
    }

    /// All `playlist_create_url` entries for a station, in document order.
    pub async fn stream_urls(&self, station_id: &str) -> Result<Vec<String>, ResolveError> {
        let url = self.config.stream_xml_url_fmt.replace("{}", station_id);
        let resp = self.client.get(&url).send().await?;
        check_status(&resp, &url)?;
        let body = resp.text().await?;
        let urls = parse_stream_urls(&body)?;
        if urls.is_empty() {
            return Err(ResolveError::NoStreamUrl(station_id.to_string()));
        }
        Ok(urls)
    }

    /// Stations broadcasting in `area_id`.
    pub async fn list_stations(&self, area_id: &str) -> Result<Vec<Station>, ResolveError> {
        let url = self.config.station_list_url_fmt.replace("{}", area_id);
        let resp = self.client.get(&url).send().await?;
        check_status(&resp, &url)?;
        let body = resp.text().await?;
        parse_station_list(&body)
    }
}

#[async_trait]
impl UpstreamResolver for RadikoResolver {
    async fn resolve(&self, station_id: &str) -> Result<ResolvedStream, ResolveError> {
        let auth_token = self.authenticate().await?;
        let urls = self.stream_urls(station_id).await?;
        let last = urls
            .last()
            .ok_or_else(|| ResolveError::NoStreamUrl(station_id.to_string()))?;
        let stream_url = build_stream_url(last, station_id, &generate_lsid());
        debug!("Resolved {} to {}", station_id, stream_url);
        Ok(ResolvedStream {
            auth_token,
            stream_url,
        })
    }
}

#[async_trait]
impl Reauthenticator for RadikoResolver {
    async fn reauthenticate(&self) -> Result<String, ResolveError> {
        self.authenticate().await
    }
}

fn check_status(resp: &reqwest::Response, url: &str) -> Result<(), ResolveError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(ResolveError::Status {
            status: resp.status().as_u16(),
            url: url.to_string(),
        })
    }
}

fn header_str(resp: &reqwest::Response, name: &'static str) -> Result<String, ResolveError> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(ResolveError::MissingHeader(name))
}

/// Base64 of the `[offset, offset+length)` slice of the HTML5 key.
pub fn partial_key(offset: usize, length: usize) -> Result<String, ResolveError> {
    let key = HTML5_AUTH_KEY.as_bytes();
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= key.len() && length > 0)
        .ok_or_else(|| {
            ResolveError::AuthFailed(format!(
                "key slice {}+{} outside {} byte key",
                offset,
                length,
                key.len()
            ))
        })?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&key[offset..end]))
}

/// Random 32-char lowercase hex listener session id.
pub fn generate_lsid() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

pub fn build_stream_url(playlist_url: &str, station_id: &str, lsid: &str) -> String {
    format!(
        "{}?station_id={}&l=30&lsid={}&type=b",
        playlist_url, station_id, lsid
    )
}

/// Extract non-empty `<playlist_create_url>` values from the stream XML.
pub fn parse_stream_urls(xml: &str) -> Result<Vec<String>, ResolveError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut in_playlist_url = false;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) if e.name().as_ref() == b"playlist_create_url" => {
                in_playlist_url = true;
            }
            Event::End(ref e) if e.name().as_ref() == b"playlist_create_url" => {
                in_playlist_url = false;
            }
            Event::Text(ref t) if in_playlist_url => {
                let url = t.unescape()?.trim().to_string();
                if !url.is_empty() {
                    urls.push(url);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(urls)
}

/// Parse `<radiko><stations><station id=".."><name>..</name>` records.
pub fn parse_station_list(xml: &str) -> Result<Vec<Station>, ResolveError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stations = Vec::new();
    let mut current: Option<Station> = None;
    let mut in_name = false;
    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.name().as_ref() {
                b"station" => {
                    let id = e
                        .try_get_attribute("id")
                        .map_err(|err| ResolveError::Xml(err.to_string()))?
                        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
                        .unwrap_or_default();
                    current = Some(Station {
                        id,
                        name: String::new(),
                    });
                }
                // Program entries nest their own <name>; only the first one
                // directly under <station> is the station name.
                b"name" => {
                    in_name = current.as_ref().is_some_and(|s| s.name.is_empty());
                }
                _ => {}
            },
            Event::Text(ref t) if in_name => {
                if let Some(station) = current.as_mut() {
                    station.name = t.unescape()?.trim().to_string();
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"name" => in_name = false,
                b"station" => {
                    if let Some(station) = current.take() {
                        if !station.id.is_empty() {
                            stations.push(station);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(stations)
}
