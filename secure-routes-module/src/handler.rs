// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Handler for the `request_filter` phase.

use async_trait::async_trait;
use http::uri::Authority;
use log::{debug, trace};
use pandora_module_utils::pingora::{Error, ErrorType, SessionWrapper};
use pandora_module_utils::standard_response::redirect_response;
use pandora_module_utils::{RequestFilter, RequestFilterResult};
use std::collections::HashSet;

use crate::configuration::{RedirectType, SecureRoutesConf, SecuredActions};
use crate::policy::{RequestContext, SecurityPolicy};
use crate::route::{path_segments, RouteParams};

const FORWARDED_PROTO: &str = "X-Forwarded-Proto";

fn conf_error(message: String) -> Box<Error> {
    Error::explain(ErrorType::InternalError, message)
}

fn validate_port(setting: &str, port: Option<u16>) -> Result<(), Box<Error>> {
    if port == Some(0) {
        Err(conf_error(format!("{setting} setting cannot be 0")))
    } else {
        Ok(())
    }
}

/// Removes the port from a host name, also validating it
fn host_name(host: &str) -> Option<String> {
    let authority: Authority = host.parse().ok()?;
    if authority.as_str().contains('@') {
        None
    } else {
        Some(authority.host().to_owned())
    }
}

/// Handler for Pingora’s `request_filter` phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureRoutesHandler {
    policy: SecurityPolicy,
    routing_prefixes: HashSet<String>,
    exclude: Vec<Vec<String>>,
    redirect_type: RedirectType,
    server_name: Option<String>,
    trust_forwarded_proto: bool,
}

impl TryFrom<SecureRoutesConf> for SecureRoutesHandler {
    type Error = Box<Error>;

    fn try_from(conf: SecureRoutesConf) -> Result<Self, Self::Error> {
        debug!("Secure routes configuration received: {conf:#?}");

        for (controller, actions) in &conf.secure_controllers {
            if controller.is_empty() {
                return Err(conf_error(
                    "secure_controllers setting cannot contain empty controller names".to_owned(),
                ));
            }

            if let SecuredActions::Actions(actions) = actions {
                if actions.is_empty() || actions.contains("") {
                    return Err(conf_error(format!(
                        "secure_controllers setting has no valid actions for controller {controller}"
                    )));
                }
            }
        }

        if conf
            .secure_prefixes
            .iter()
            .chain(conf.secure_routing_prefixes.iter())
            .any(String::is_empty)
        {
            return Err(conf_error(
                "secure_prefixes and secure_routing_prefixes settings cannot contain empty prefixes"
                    .to_owned(),
            ));
        }

        if let Some(path) = conf
            .secure_exclude
            .iter()
            .find(|path| !path.starts_with('/'))
        {
            return Err(conf_error(format!(
                "secure_exclude setting has to contain absolute paths, got {path}"
            )));
        }

        validate_port("secure_https_port", conf.secure_https_port)?;
        validate_port("secure_http_port", conf.secure_http_port)?;

        if let Some(server_name) = &conf.secure_server_name {
            if host_name(server_name).as_ref() != Some(server_name) {
                return Err(conf_error(format!(
                    "secure_server_name setting has to be a host name without port, got {server_name}"
                )));
            }
        }

        let prefixes: HashSet<_> = conf.secure_prefixes.into_iter().collect();
        let routing_prefixes = prefixes
            .iter()
            .cloned()
            .chain(conf.secure_routing_prefixes)
            .collect();

        Ok(Self {
            policy: SecurityPolicy {
                secured: conf.secure_controllers,
                prefixes,
                auto_redirect: conf.secure_auto_redirect,
                https_port: conf.secure_https_port,
                http_port: conf.secure_http_port,
            },
            routing_prefixes,
            exclude: conf
                .secure_exclude
                .iter()
                .map(|path| path_segments(path))
                .collect(),
            redirect_type: conf.secure_redirect_type,
            server_name: conf.secure_server_name,
            trust_forwarded_proto: conf.secure_trust_forwarded_proto,
        })
    }
}

impl SecureRoutesHandler {
    /// The security policy applied by this handler
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Checks whether a path is at or below one of the paths in `secure_exclude`
    pub fn is_excluded(&self, path: &str) -> bool {
        let segments = path_segments(path);
        self.exclude
            .iter()
            .any(|excluded| segments.starts_with(excluded))
    }

    /// Resolves the route parameters of the request.
    ///
    /// This uses the current request URI which might have been modified by other handlers.
    pub fn route_params(&self, session: &impl SessionWrapper) -> RouteParams {
        RouteParams::from_path(session.uri().path(), &self.routing_prefixes)
    }

    /// Collects the transport properties of the request.
    ///
    /// The path in the result is taken from the original request URI, so that redirects will
    /// preserve the URI requested by the client.
    pub fn request_context(&self, session: &impl SessionWrapper) -> RequestContext {
        let tls = session
            .digest()
            .is_some_and(|digest| digest.ssl_digest.is_some());
        let forwarded_https = self.trust_forwarded_proto
            && session
                .req_header()
                .headers
                .get(FORWARDED_PROTO)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));

        let host = match &self.server_name {
            Some(server_name) => Some(server_name.clone()),
            None => session.host().and_then(|host| host_name(&host)),
        };

        let path = session
            .original_uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/")
            .to_owned();

        RequestContext {
            secure: tls || forwarded_https,
            host,
            path,
        }
    }
}

#[async_trait]
impl RequestFilter for SecureRoutesHandler {
    type Conf = SecureRoutesConf;

    type CTX = ();

    fn new_ctx() -> Self::CTX {}

    async fn request_filter(
        &self,
        session: &mut impl SessionWrapper,
        _ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>> {
        if self.policy.is_empty() {
            return Ok(RequestFilterResult::Unhandled);
        }

        if self.is_excluded(session.uri().path()) {
            trace!("Path {} excluded from secure routes", session.uri().path());
            return Ok(RequestFilterResult::Unhandled);
        }

        let params = self.route_params(session);
        let request = self.request_context(session);
        let decision = self.policy.evaluate(&params, &request);
        trace!("Secure routes decision for {}: {decision:?}", request.path);

        session.extensions_mut().insert(decision.clone());

        if self.policy.auto_redirect {
            if let Some(location) = decision.location() {
                redirect_response(session, self.redirect_type.status(), location).await?;
                return Ok(RequestFilterResult::ResponseSent);
            }
        }

        Ok(RequestFilterResult::Unhandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{header, Extensions, StatusCode};
    use pandora_module_utils::pingora::{create_test_session, RequestHeader, Session};
    use std::ops::{Deref, DerefMut};
    use pandora_module_utils::FromYaml;
    use startup_module::{AppResult, DefaultApp};
    use test_log::test;

    use crate::policy::Decision;

    fn make_handler(conf: &str) -> Result<SecureRoutesHandler, Box<Error>> {
        <SecureRoutesHandler as RequestFilter>::Conf::from_yaml(conf)
            .unwrap()
            .try_into()
    }

    fn make_app(conf: &str) -> DefaultApp<SecureRoutesHandler> {
        DefaultApp::new(make_handler(conf).unwrap())
    }

    async fn make_session(path: &str, headers: &[(&'static str, &'static str)]) -> Session {
        let mut header = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        for (name, value) in headers {
            header.insert_header(*name, *value).unwrap();
        }
        create_test_session(header).await
    }

    struct TestSession {
        inner: Session,
        extensions: Extensions,
    }

    impl Deref for TestSession {
        type Target = Session;

        fn deref(&self) -> &Self::Target {
            &self.inner
        }
    }

    impl DerefMut for TestSession {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.inner
        }
    }

    #[async_trait]
    impl SessionWrapper for TestSession {
        fn extensions(&self) -> &Extensions {
            &self.extensions
        }

        fn extensions_mut(&mut self) -> &mut Extensions {
            &mut self.extensions
        }
    }

    async fn make_wrapper(path: &str, headers: &[(&'static str, &'static str)]) -> TestSession {
        TestSession {
            inner: make_session(path, headers).await,
            extensions: Extensions::new(),
        }
    }

    fn assert_redirect(result: &mut AppResult, status: StatusCode, location: &str) {
        assert!(result.err().is_none());
        let session = result.session();
        let response = session.response_written().unwrap();
        assert_eq!(response.status, status);
        assert_eq!(
            response
                .headers
                .get(header::LOCATION)
                .map(|value| value.to_str().unwrap()),
            Some(location)
        );
    }

    fn assert_unhandled(result: &mut AppResult, decision: Option<Decision>) {
        assert_eq!(
            result.err().as_ref().map(|err| &err.etype),
            Some(&ErrorType::HTTPStatus(404))
        );
        let session = result.session();
        assert_eq!(session.extensions().get::<Decision>(), decision.as_ref());
    }

    const CONF: &str = r#"
secure_controllers:
    users: "*"
    accounts: [login, register]
secure_prefixes: admin
secure_routing_prefixes: api"#;

    #[test(tokio::test)]
    async fn unconfigured() {
        let mut app = make_app("{}");

        let session = make_session("/users/login", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, None);

        let session = make_session(
            "/users/login",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, None);
    }

    #[test(tokio::test)]
    async fn redirect_to_secure() {
        let mut app = make_app(CONF);

        let session = make_session("/users/login", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/users/login",
        );

        let session = make_session("/accounts/register?plan=pro", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/accounts/register?plan=pro",
        );

        let session = make_session("/admin/pages/edit/3", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/admin/pages/edit/3",
        );

        let session = make_session("/users", &[("Host", "example.com:8080")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(&mut result, StatusCode::FOUND, "https://example.com/users");
    }

    #[test(tokio::test)]
    async fn insecure_allowed() {
        let mut app = make_app(CONF);

        let session = make_session("/accounts/profile", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));

        let session = make_session("/api/orders/list", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));

        let session = make_session("/", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));
    }

    #[test(tokio::test)]
    async fn forwarded_proto() {
        let mut app = make_app(&format!("{CONF}\nsecure_trust_forwarded_proto: true"));

        let session = make_session(
            "/users/login",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));

        let session = make_session(
            "/pages/display/about",
            &[("Host", "example.com"), (FORWARDED_PROTO, "HTTPS, http")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "http://example.com/pages/display/about",
        );

        let session = make_session(
            "/users/login",
            &[("Host", "example.com"), (FORWARDED_PROTO, "http")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/users/login",
        );
    }

    #[test(tokio::test)]
    async fn forwarded_proto_untrusted() {
        let mut app = make_app(CONF);

        let session = make_session(
            "/users/login",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/users/login",
        );

        let session = make_session(
            "/pages/display/about",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));
    }

    #[test(tokio::test)]
    async fn excluded_paths() {
        let mut app = make_app(&format!(
            "{CONF}\nsecure_exclude: [/css, /favicon.ico]\nsecure_trust_forwarded_proto: true"
        ));

        let session = make_session(
            "/css/site.css",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, None);

        let session = make_session(
            "/favicon.ico?v=2",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, None);

        let session = make_session("/css/../users/login", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "https://example.com/css/../users/login",
        );

        // Prefix has to match whole segments
        let session = make_session(
            "/cssfiles/site.css",
            &[("Host", "example.com"), (FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::FOUND,
            "http://example.com/cssfiles/site.css",
        );
    }

    #[test(tokio::test)]
    async fn transport_detection() {
        let handler = make_handler(CONF).unwrap();

        let session = make_wrapper(
            "/users/login?x=1",
            &[("Host", "example.com:8080"), (FORWARDED_PROTO, "https")],
        )
        .await;
        assert!(session.digest().map_or(true, |digest| digest.ssl_digest.is_none()));
        assert_eq!(
            handler.request_context(&session),
            RequestContext {
                secure: false,
                host: Some("example.com".to_owned()),
                path: "/users/login?x=1".to_owned(),
            }
        );

        let handler = make_handler(&format!("{CONF}\nsecure_trust_forwarded_proto: true")).unwrap();
        assert!(handler.request_context(&session).secure);

        let session = make_wrapper("/users/login", &[("Host", "example.com")]).await;
        assert!(!handler.request_context(&session).secure);

        let session = make_wrapper(
            "/users/login",
            &[("Host", "example.com"), (FORWARDED_PROTO, "http, https")],
        )
        .await;
        assert!(!handler.request_context(&session).secure);
    }

    #[test(tokio::test)]
    async fn no_auto_redirect() {
        let mut app = make_app(&format!("{CONF}\nsecure_auto_redirect: false"));

        let session = make_session("/users/login", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(
            &mut result,
            Some(Decision::RedirectToSecure(
                "https://example.com/users/login".to_owned(),
            )),
        );
    }

    #[test(tokio::test)]
    async fn redirect_settings() {
        let mut app = make_app(&format!(
            r#"{CONF}
secure_redirect_type: permanent
secure_server_name: www.example.com
secure_https_port: 8443
secure_http_port: 8080
secure_trust_forwarded_proto: true"#
        ));

        let session = make_session("/users/login", &[("Host", "example.com")]).await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::MOVED_PERMANENTLY,
            "https://www.example.com:8443/users/login",
        );

        let session = make_session(
            "/pages/display/about",
            &[(FORWARDED_PROTO, "https")],
        )
        .await;
        let mut result = app.handle_request(session).await;
        assert_redirect(
            &mut result,
            StatusCode::MOVED_PERMANENTLY,
            "http://www.example.com:8080/pages/display/about",
        );
    }

    #[test(tokio::test)]
    async fn unknown_host() {
        let mut app = make_app(CONF);

        let session = make_session("/users/login", &[]).await;
        let mut result = app.handle_request(session).await;
        assert_unhandled(&mut result, Some(Decision::NoAction));
    }

    #[test]
    fn invalid_configuration() {
        assert!(make_handler(CONF).is_ok());

        assert!(make_handler("secure_https_port: 0").is_err());
        assert!(make_handler("secure_http_port: 0").is_err());
        assert!(make_handler("secure_server_name: example.com:443").is_err());
        assert!(make_handler("secure_server_name: user@example.com").is_err());
        assert!(make_handler("secure_server_name: example.com/path").is_err());
        assert!(make_handler("secure_prefixes: ['']").is_err());
        assert!(make_handler("secure_routing_prefixes: ['']").is_err());
        assert!(make_handler("secure_exclude: css").is_err());
        assert!(make_handler(
            r#"
                secure_controllers:
                    "": "*"
            "#
        )
        .is_err());
        assert!(make_handler(
            r#"
                secure_controllers:
                    users: []
            "#
        )
        .is_err());
        assert!(make_handler(
            r#"
                secure_controllers:
                    users: [login, ""]
            "#
        )
        .is_err());
    }

    #[test]
    fn policy_from_configuration() {
        let handler = make_handler(CONF).unwrap();
        let policy = handler.policy();
        assert!(policy.auto_redirect);
        assert_eq!(policy.secured.len(), 2);
        assert_eq!(
            policy.prefixes,
            HashSet::from(["admin".to_owned()])
        );
        assert!(policy.requires_secure(&RouteParams::new("users", "logout")));
        assert!(!policy.requires_secure(&RouteParams::new("accounts", "logout")));

        let handler = make_handler(&format!("{CONF}\nsecure_exclude: [/css/, /img/icons]")).unwrap();
        assert!(handler.is_excluded("/css"));
        assert!(handler.is_excluded("/css/site.css"));
        assert!(handler.is_excluded("//img/./icons/x.png"));
        assert!(!handler.is_excluded("/img/logo.png"));
        assert!(!handler.is_excluded("/css/../users/login"));
        assert!(!handler.is_excluded("/users/login"));
    }
}
