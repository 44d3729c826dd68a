//! OAuth 1.0a request signing and the three-legged token exchange.
//!
//! Nokia Health and Vitadock both still speak OAuth 1.0a. They differ in the
//! signature hash and in where the `oauth_*` parameters travel (query string
//! vs. `Authorization` header), so both are parameters of [`OAuth1Client`].
//! The signer keeps no state between calls; token storage belongs to the
//! caller.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode, Url};
use sha1::Sha1;
use sha2::Sha256;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Maximum number of response-body characters carried inside an error.
const ERROR_BODY_MAX_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    HmacSha256,
}

impl SignatureMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
        }
    }
}

/// Where the `oauth_*` protocol parameters are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamPlacement {
    Header,
    Query,
}

/// A key/secret pair: consumer credentials, a request token or an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Percent-encode per RFC 3986: everything except `A-Z a-z 0-9 - . _ ~`.
pub fn percent_encode(value: &str) -> Cow<'_, str> {
    urlencoding::encode(value)
}

/// Base string URI: scheme and host lower-cased, default port dropped, no
/// query or fragment.
pub fn normalize_url(url: &Url) -> String {
    let mut out = format!(
        "{}://{}",
        url.scheme().to_ascii_lowercase(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    // `Url::port` is `None` when the port is the scheme default.
    if let Some(port) = url.port() {
        let _ = write!(out, ":{port}");
    }
    out.push_str(url.path());
    out
}

/// Signature base string over `params` plus any query parameters in `url`.
///
/// Parameters are encoded first and then sorted by key, then by value.
pub fn base_string(http_method: &str, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (percent_encode(&k).into_owned(), percent_encode(&v).into_owned()))
        .chain(
            params
                .iter()
                .map(|(k, v)| (percent_encode(k).into_owned(), percent_encode(v).into_owned())),
        )
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        http_method.to_ascii_uppercase(),
        percent_encode(&normalize_url(url)),
        percent_encode(&param_string)
    )
}

/// `consumer_secret&token_secret`, with an empty token secret on the first leg.
pub fn signing_key(consumer_secret: &str, token_secret: Option<&str>) -> String {
    format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or_default())
    )
}

fn compute_signature(
    method: SignatureMethod,
    key: &str,
    base_string: &str,
) -> Result<String, OAuthError> {
    let digest = match method {
        SignatureMethod::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
                .map_err(|e| OAuthError::Signing(e.to_string()))?;
            mac.update(base_string.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        SignatureMethod::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .map_err(|e| OAuthError::Signing(e.to_string()))?;
            mac.update(base_string.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// The protocol parameters of one signed request, `oauth_signature` included.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub oauth_params: Vec<(String, String)>,
    pub signature: String,
    pub base_string: String,
}

impl SignedRequest {
    pub fn authorization_header(&self) -> String {
        let fields = self
            .oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        format!("OAuth {fields}")
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.oauth_params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.oauth_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Signer {
    consumer: Credentials,
    method: SignatureMethod,
}

impl Signer {
    pub fn new(consumer: Credentials, method: SignatureMethod) -> Self {
        Self { consumer, method }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer.key
    }

    pub fn method(&self) -> SignatureMethod {
        self.method
    }

    /// Sign with a fresh nonce and the current timestamp.
    pub fn sign(
        &self,
        http_method: &str,
        url: &str,
        params: &[(String, String)],
        token: Option<&Credentials>,
        extra_oauth: &[(&str, &str)],
    ) -> Result<SignedRequest, OAuthError> {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.sign_with(http_method, url, params, token, extra_oauth, &nonce, &timestamp)
    }

    /// Sign with caller-provided nonce and timestamp. Same inputs, same output.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_with(
        &self,
        http_method: &str,
        url: &str,
        params: &[(String, String)],
        token: Option<&Credentials>,
        extra_oauth: &[(&str, &str)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<SignedRequest, OAuthError> {
        let parsed = Url::parse(url).map_err(|_| OAuthError::InvalidUrl(url.to_string()))?;

        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.consumer.key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), self.method.as_str().into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_version".into(), "1.0".into()),
        ];
        if let Some(token) = token {
            oauth_params.push(("oauth_token".into(), token.key.clone()));
        }
        oauth_params.extend(
            extra_oauth
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        );

        let mut all_params = params.to_vec();
        all_params.extend(oauth_params.iter().cloned());
        let base_string = base_string(http_method, &parsed, &all_params);
        let key = signing_key(&self.consumer.secret, token.map(|t| t.secret.as_str()));
        let signature = compute_signature(self.method, &key, &base_string)?;

        oauth_params.push(("oauth_signature".into(), signature.clone()));
        Ok(SignedRequest {
            oauth_params,
            signature,
            base_string,
        })
    }

    /// Expected `oauth_signature` of an inbound request signed with our
    /// consumer secret and `token_secret`. The base string is built from the
    /// `oauth_*` parameters exactly as received (`realm` and the signature
    /// itself excluded) plus `params`.
    pub fn signature_for(
        &self,
        http_method: &str,
        url: &str,
        params: &[(String, String)],
        oauth: &BTreeMap<String, String>,
        token_secret: Option<&str>,
    ) -> Result<String, OAuthError> {
        let parsed = Url::parse(url).map_err(|_| OAuthError::InvalidUrl(url.to_string()))?;
        let mut all_params = params.to_vec();
        all_params.extend(
            oauth
                .iter()
                .filter(|(k, _)| k.as_str() != "oauth_signature" && k.as_str() != "realm")
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        let base_string = base_string(http_method, &parsed, &all_params);
        let key = signing_key(&self.consumer.secret, token_secret);
        compute_signature(self.method, &key, &base_string)
    }
}

/// Parse an inbound `Authorization: OAuth k="v", ...` header.
pub fn parse_authorization_header(value: &str) -> Option<BTreeMap<String, String>> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("OAuth") {
        return None;
    }

    let mut params = BTreeMap::new();
    for part in rest.split(',') {
        let Some((key, raw)) = part.trim().split_once('=') else {
            continue;
        };
        let raw = raw.trim().trim_matches('"');
        let decoded = urlencoding::decode(raw).map(Cow::into_owned).ok()?;
        params.insert(key.trim().to_string(), decoded);
    }
    Some(params)
}

/// Decode an `application/x-www-form-urlencoded` body.
pub fn parse_form_body(body: &str) -> BTreeMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = urlencoding::decode(&k.replace('+', " ")).ok()?.into_owned();
            let v = urlencoding::decode(&v.replace('+', " ")).ok()?.into_owned();
            Some((k, v))
        })
        .collect()
}

/// Provider endpoints of the three-legged flow.
#[derive(Debug, Clone)]
pub struct OAuth1Endpoints {
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
}

/// Access token plus whatever else the provider returned (e.g. Nokia `userid`).
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub credentials: Credentials,
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct OAuth1Client {
    http: reqwest::Client,
    signer: Signer,
    endpoints: OAuth1Endpoints,
    placement: ParamPlacement,
    token_method: Method,
}

impl OAuth1Client {
    pub fn new(
        consumer: Credentials,
        method: SignatureMethod,
        endpoints: OAuth1Endpoints,
        placement: ParamPlacement,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            signer: Signer::new(consumer, method),
            endpoints,
            placement,
            token_method: Method::GET,
        }
    }

    /// HTTP method used on the request-token and access-token legs.
    pub fn with_token_method(mut self, method: Method) -> Self {
        self.token_method = method;
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Leg 1: obtain an unauthorized request token.
    pub async fn request_token(&self, callback: &str) -> Result<Credentials, OAuthError> {
        let url = self.endpoints.request_token_url.clone();
        let signed = self.signer.sign(
            self.token_method.as_str(),
            &url,
            &[],
            None,
            &[("oauth_callback", callback)],
        )?;
        let body = self.send(&self.token_method, &url, &[], &signed).await?;
        let fields = parse_token_body(&body)?;
        Ok(take_credentials(fields)?.0)
    }

    /// Leg 2: where the end user authorizes the request token.
    pub fn authorize_url(&self, request_token: &Credentials) -> Result<String, OAuthError> {
        let mut url = Url::parse(&self.endpoints.authorize_url)
            .map_err(|_| OAuthError::InvalidUrl(self.endpoints.authorize_url.clone()))?;
        match self.placement {
            ParamPlacement::Query => {
                let signed = self.signer.sign(
                    "GET",
                    &self.endpoints.authorize_url,
                    &[],
                    Some(request_token),
                    &[],
                )?;
                url.query_pairs_mut().extend_pairs(signed.query_pairs());
            }
            ParamPlacement::Header => {
                url.query_pairs_mut()
                    .append_pair("oauth_consumer_key", self.signer.consumer_key())
                    .append_pair("oauth_token", &request_token.key);
            }
        }
        Ok(url.to_string())
    }

    /// Leg 3: trade the verifier and the request token for an access token.
    pub async fn access_token(
        &self,
        request_token: &Credentials,
        verifier: &str,
    ) -> Result<AccessToken, OAuthError> {
        let url = self.endpoints.access_token_url.clone();
        let signed = self.signer.sign(
            self.token_method.as_str(),
            &url,
            &[],
            Some(request_token),
            &[("oauth_verifier", verifier)],
        )?;
        let body = self.send(&self.token_method, &url, &[], &signed).await?;
        let fields = parse_token_body(&body)?;
        let (credentials, extra) = take_credentials(fields)?;
        Ok(AccessToken { credentials, extra })
    }

    /// Signed GET returning parsed JSON. A successful empty body is `Null`.
    pub async fn get_json(
        &self,
        url: &str,
        params: &[(String, String)],
        token: &Credentials,
    ) -> Result<serde_json::Value, OAuthError> {
        let signed = self.signer.sign("GET", url, params, Some(token), &[])?;
        let body = self.send(&Method::GET, url, params, &signed).await?;
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| {
            OAuthError::Malformed(format!(
                "{e}: {}",
                crate::util::truncate_with_ellipsis(&body, ERROR_BODY_MAX_CHARS)
            ))
        })
    }

    async fn send(
        &self,
        http_method: &Method,
        url: &str,
        params: &[(String, String)],
        signed: &SignedRequest,
    ) -> Result<String, OAuthError> {
        let mut request = self.http.request(http_method.clone(), url).query(params);
        request = match self.placement {
            ParamPlacement::Header => request.header(AUTHORIZATION, signed.authorization_header()),
            ParamPlacement::Query => request.query(signed.query_pairs()),
        };

        let response = request.send().await.map_err(|source| OAuthError::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| OAuthError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !status.is_success() {
            tracing::warn!("OAuth provider {url} returned {status}");
            return Err(OAuthError::Status {
                status,
                body: crate::util::truncate_with_ellipsis(body.trim(), ERROR_BODY_MAX_CHARS),
            });
        }
        Ok(body)
    }
}

/// Token endpoints answer form-encoded on success and JSON on failure.
fn parse_token_body(body: &str) -> Result<BTreeMap<String, String>, OAuthError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(OAuthError::Malformed("empty token response".into()));
    }
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| OAuthError::Malformed(format!("unexpected JSON body: {e}")))?;
        return Err(provider_error(&value)
            .unwrap_or_else(|| OAuthError::Malformed("JSON body without tokens".into())));
    }
    Ok(parse_form_body(trimmed))
}

fn take_credentials(
    mut fields: BTreeMap<String, String>,
) -> Result<(Credentials, BTreeMap<String, String>), OAuthError> {
    let key = fields.remove("oauth_token").filter(|v| !v.is_empty());
    let secret = fields.remove("oauth_token_secret").filter(|v| !v.is_empty());
    match (key, secret) {
        (Some(key), Some(secret)) => Ok((Credentials { key, secret }, fields)),
        _ => Err(OAuthError::Malformed(
            "response lacks oauth_token/oauth_token_secret".into(),
        )),
    }
}

/// Interpret a `{"status": <non-zero>, "error": ...}` style payload.
pub fn provider_error(value: &serde_json::Value) -> Option<OAuthError> {
    let code = value.get("status").and_then(serde_json::Value::as_i64)?;
    if code == 0 {
        return None;
    }
    let message = value
        .get("error")
        .or_else(|| value.get("message"))
        .map(|m| match m {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    Some(OAuthError::Provider { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn photos_signer() -> Signer {
        Signer::new(
            Credentials::new("dpf43f3p2l4k3l03", "kd94hf93k423kf44"),
            SignatureMethod::HmacSha1,
        )
    }

    fn photos_token() -> Credentials {
        Credentials::new("nnch734d00sl2jdk", "pfkkdhi9sl3r4s00")
    }

    fn endpoints(server: &MockServer) -> OAuth1Endpoints {
        OAuth1Endpoints {
            request_token_url: format!("{}/oauth/request_token", server.uri()),
            authorize_url: format!("{}/oauth/authorize", server.uri()),
            access_token_url: format!("{}/oauth/access_token", server.uri()),
        }
    }

    fn header_client(server: &MockServer) -> OAuth1Client {
        OAuth1Client::new(
            Credentials::new("consumer", "consumer-secret"),
            SignatureMethod::HmacSha256,
            endpoints(server),
            ParamPlacement::Header,
        )
    }

    #[test]
    fn reference_request_produces_known_base_string_and_signature() {
        let signed = photos_signer()
            .sign_with(
                "GET",
                "http://photos.example.net/photos?file=vacation.jpg&size=original",
                &[],
                Some(&photos_token()),
                &[],
                "kllo9940pd9333jh",
                "1191242096",
            )
            .unwrap();

        assert_eq!(
            signed.base_string,
            "GET&http%3A%2F%2Fphotos.example.net%2Fphotos&file%3Dvacation.jpg%26\
             oauth_consumer_key%3Ddpf43f3p2l4k3l03%26oauth_nonce%3Dkllo9940pd9333jh%26\
             oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1191242096%26\
             oauth_token%3Dnnch734d00sl2jdk%26oauth_version%3D1.0%26size%3Doriginal"
        );
        assert_eq!(signed.signature, "tR3+Ty81lMeYAr/Fid0kMTYa/WM=");
    }

    #[test]
    fn signing_is_deterministic_for_fixed_nonce_and_timestamp() {
        let params = vec![("action".to_string(), "getmeas".to_string())];
        let sign = || {
            photos_signer()
                .sign_with(
                    "GET",
                    "https://api.example.com/measure",
                    &params,
                    Some(&photos_token()),
                    &[],
                    "nonce",
                    "1500000000",
                )
                .unwrap()
        };
        let first = sign();
        let second = sign();
        assert_eq!(first.base_string, second.base_string);
        assert_eq!(first.signature, second.signature);
    }

    #[test]
    fn sha256_signature_differs_from_sha1() {
        let sha1 = photos_signer()
            .sign_with("GET", "https://a.example/x", &[], None, &[], "n", "1")
            .unwrap();
        let sha256 = Signer::new(
            Credentials::new("dpf43f3p2l4k3l03", "kd94hf93k423kf44"),
            SignatureMethod::HmacSha256,
        )
        .sign_with("GET", "https://a.example/x", &[], None, &[], "n", "1")
        .unwrap();

        assert_ne!(sha1.signature, sha256.signature);
        assert_eq!(sha1.signature.len(), 28);
        assert_eq!(sha256.signature.len(), 44);
        assert_eq!(sha256.param("oauth_signature_method"), Some("HMAC-SHA256"));
    }

    #[test]
    fn percent_encoding_follows_rfc3986_unreserved_set() {
        assert_eq!(percent_encode("AZaz09-._~"), "AZaz09-._~");
        assert_eq!(
            percent_encode("Ladies + Gentlemen"),
            "Ladies%20%2B%20Gentlemen"
        );
        assert_eq!(percent_encode("a&b=c/d"), "a%26b%3Dc%2Fd");
        assert_eq!(percent_encode("é"), "%C3%A9");
        assert_eq!(percent_encode("*"), "%2A");
    }

    #[test]
    fn parameters_are_sorted_by_key_then_value() {
        let url = Url::parse("https://example.com/r?b=2&a=3").unwrap();
        let params = vec![
            ("a".to_string(), "1".to_string()),
            ("c".to_string(), "0".to_string()),
        ];
        let base = base_string("post", &url, &params);
        assert_eq!(
            base,
            "POST&https%3A%2F%2Fexample.com%2Fr&a%3D1%26a%3D3%26b%3D2%26c%3D0"
        );
    }

    #[test]
    fn normalize_url_drops_default_port_and_query() {
        let url = Url::parse("HTTPS://Example.COM:443/Path?x=1#frag").unwrap();
        assert_eq!(normalize_url(&url), "https://example.com/Path");

        let url = Url::parse("http://example.com:8080/p").unwrap();
        assert_eq!(normalize_url(&url), "http://example.com:8080/p");
    }

    #[test]
    fn first_leg_signing_key_has_empty_token_secret() {
        assert_eq!(signing_key("kd94hf93k423kf44", None), "kd94hf93k423kf44&");
        assert_eq!(signing_key("a b", Some("c&d")), "a%20b&c%26d");
    }

    #[test]
    fn authorization_header_round_trips_through_parser() {
        let signed = photos_signer()
            .sign_with(
                "GET",
                "http://photos.example.net/photos",
                &[],
                Some(&photos_token()),
                &[],
                "kllo9940pd9333jh",
                "1191242096",
            )
            .unwrap();

        let header = signed.authorization_header();
        assert!(header.starts_with("OAuth "));

        let parsed = parse_authorization_header(&header).unwrap();
        assert_eq!(parsed["oauth_token"], "nnch734d00sl2jdk");
        assert_eq!(parsed["oauth_signature"], signed.signature);
        assert_eq!(parsed["oauth_version"], "1.0");
    }

    #[test]
    fn inbound_signature_is_reproduced_from_parsed_header() {
        let signer = Signer::new(Credentials::new("app", "app-secret"), SignatureMethod::HmacSha256);
        let token = Credentials::new("access", "access-secret");
        let url = "https://paula.example/webhook/vitadock?module=tensodata";
        let signed = signer
            .sign_with("POST", url, &[], Some(&token), &[], "n0nce", "1500000000")
            .unwrap();
        let parsed = parse_authorization_header(&signed.authorization_header()).unwrap();

        let expected = signer
            .signature_for("POST", url, &[], &parsed, Some("access-secret"))
            .unwrap();
        assert_eq!(expected, signed.signature);

        let wrong_secret = signer
            .signature_for("POST", url, &[], &parsed, Some("guess"))
            .unwrap();
        assert_ne!(wrong_secret, signed.signature);
        let wrong_method = signer
            .signature_for("GET", url, &[], &parsed, Some("access-secret"))
            .unwrap();
        assert_ne!(wrong_method, signed.signature);
    }

    #[test]
    fn non_oauth_authorization_header_is_rejected() {
        assert!(parse_authorization_header("Bearer abc").is_none());
    }

    #[test]
    fn form_body_is_decoded() {
        let fields = parse_form_body("oauth_token=abc&oauth_token_secret=d%2Fe&userid=12+3");
        assert_eq!(fields["oauth_token"], "abc");
        assert_eq!(fields["oauth_token_secret"], "d/e");
        assert_eq!(fields["userid"], "12 3");
    }

    #[tokio::test]
    async fn request_token_is_parsed_from_form_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/request_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("oauth_token=req-key&oauth_token_secret=req-secret"),
            )
            .mount(&server)
            .await;

        let client = header_client(&server);
        let token = client
            .request_token("https://paula.example/connect/vitadock")
            .await
            .unwrap();
        assert_eq!(token, Credentials::new("req-key", "req-secret"));

        let requests = server.received_requests().await.unwrap();
        let header = requests[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        let params = parse_authorization_header(&header).unwrap();
        assert_eq!(
            params["oauth_callback"],
            "https://paula.example/connect/vitadock"
        );
        assert!(!params.contains_key("oauth_token"));
    }

    #[tokio::test]
    async fn access_token_exchange_sends_only_verifier_and_request_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "oauth_token=acc-key&oauth_token_secret=acc-secret&userid=4242",
            ))
            .mount(&server)
            .await;

        let client = header_client(&server);
        let request_token = Credentials::new("req-key", "req-secret");
        let access = client
            .access_token(&request_token, "verifier-123")
            .await
            .unwrap();

        assert_eq!(access.credentials, Credentials::new("acc-key", "acc-secret"));
        assert_eq!(access.extra.get("userid").map(String::as_str), Some("4242"));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let header = requests[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        let params = parse_authorization_header(&header).unwrap();
        assert_eq!(params["oauth_token"], "req-key");
        assert_eq!(params["oauth_verifier"], "verifier-123");
        assert!(!params.contains_key("oauth_callback"));

        // The signature must have been made with the request-token secret.
        let expected = client
            .signer()
            .sign_with(
                "GET",
                &format!("{}/oauth/access_token", server.uri()),
                &[],
                Some(&request_token),
                &[("oauth_verifier", "verifier-123")],
                &params["oauth_nonce"],
                &params["oauth_timestamp"],
            )
            .unwrap();
        assert_eq!(params["oauth_signature"], expected.signature);
    }

    #[tokio::test]
    async fn non_success_status_is_reported_distinctly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/request_token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid consumer"))
            .mount(&server)
            .await;

        let err = header_client(&server)
            .request_token("https://cb.example")
            .await
            .unwrap_err();
        match err {
            OAuthError::Status { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "invalid consumer");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_error_payload_is_not_mistaken_for_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"status":2555,"error":"Unknown token"}"#),
            )
            .mount(&server)
            .await;

        let err = header_client(&server)
            .access_token(&Credentials::new("k", "s"), "v")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Provider { code: 2555, .. }));
    }

    #[tokio::test]
    async fn garbage_token_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/request_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = header_client(&server)
            .request_token("https://cb.example")
            .await
            .unwrap_err();
        assert!(matches!(err, OAuthError::Malformed(_)));
    }

    #[tokio::test]
    async fn empty_successful_data_body_is_null_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let value = header_client(&server)
            .get_json(
                &format!("{}/data", server.uri()),
                &[],
                &Credentials::new("k", "s"),
            )
            .await
            .unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn query_placement_sends_oauth_params_in_query_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/measure"))
            .and(query_param("action", "getmeas"))
            .and(query_param("oauth_signature_method", "HMAC-SHA1"))
            .and(query_param("oauth_token", "acc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let client = OAuth1Client::new(
            Credentials::new("consumer", "secret"),
            SignatureMethod::HmacSha1,
            endpoints(&server),
            ParamPlacement::Query,
        );
        let value = client
            .get_json(
                &format!("{}/measure", server.uri()),
                &[("action".to_string(), "getmeas".to_string())],
                &Credentials::new("acc", "acc-secret"),
            )
            .await
            .unwrap();
        assert_eq!(value["status"], 0);
    }

    #[test]
    fn header_placement_authorize_url_carries_consumer_key_and_token() {
        let client = OAuth1Client::new(
            Credentials::new("app token", "secret"),
            SignatureMethod::HmacSha256,
            OAuth1Endpoints {
                request_token_url: "https://v.example/auth/unauthorizedaccesses".into(),
                authorize_url: "https://v.example/desiredaccessrights/request".into(),
                access_token_url: "https://v.example/auth/accesses/verify".into(),
            },
            ParamPlacement::Header,
        );
        let url = client
            .authorize_url(&Credentials::new("req", "req-secret"))
            .unwrap();
        assert_eq!(
            url,
            "https://v.example/desiredaccessrights/request?oauth_consumer_key=app+token&oauth_token=req"
        );
    }
}
