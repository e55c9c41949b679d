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

//! The security policy deciding whether a request needs to be redirected to another scheme

use log::{trace, warn};
use std::collections::{HashMap, HashSet};

use crate::configuration::SecuredActions;
use crate::route::RouteParams;

/// Transport properties of the current request
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// `true` if the request arrived via a secure transport
    pub secure: bool,
    /// Host name to redirect to, without the port
    pub host: Option<String>,
    /// Path and query of the request, preserved in the redirect target
    pub path: String,
}

/// Outcome of evaluating the security policy for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request transport matches the policy
    NoAction,
    /// Request should be repeated via HTTPS at the given URL
    RedirectToSecure(String),
    /// Request should be repeated via plain HTTP at the given URL
    RedirectToInsecure(String),
}

impl Decision {
    /// Returns the redirect target if a redirect is required
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::NoAction => None,
            Self::RedirectToSecure(location) | Self::RedirectToInsecure(location) => {
                Some(location)
            }
        }
    }
}

/// Static configuration determining which routes are served via HTTPS only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Controllers with their actions requiring HTTPS
    pub secured: HashMap<String, SecuredActions>,
    /// Route prefixes requiring HTTPS for all actions
    pub prefixes: HashSet<String>,
    /// Whether redirects should be issued automatically
    pub auto_redirect: bool,
    /// Non-default port of HTTPS redirect targets
    pub https_port: Option<u16>,
    /// Non-default port of HTTP redirect targets
    pub http_port: Option<u16>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            secured: HashMap::new(),
            prefixes: HashSet::new(),
            auto_redirect: true,
            https_port: None,
            http_port: None,
        }
    }
}

impl SecurityPolicy {
    const HTTPS_DEFAULT_PORT: u16 = 443;
    const HTTP_DEFAULT_PORT: u16 = 80;

    /// `true` if nothing is secured by this policy
    pub fn is_empty(&self) -> bool {
        self.secured.is_empty() && self.prefixes.is_empty()
    }

    /// Determines whether a route has to be served via HTTPS
    pub fn requires_secure(&self, params: &RouteParams) -> bool {
        if !self.prefixes.is_empty() {
            if let Some(prefix) = params.prefix() {
                if self.prefixes.contains(prefix) {
                    return true;
                }
            }
        }

        let Some(actions) = params
            .controller()
            .and_then(|controller| self.secured.get(controller))
        else {
            return false;
        };

        match actions {
            SecuredActions::AllActions => true,
            SecuredActions::Actions(_) => params
                .action()
                .is_some_and(|action| actions.contains(action)),
        }
    }

    /// Compares the policy verdict for the route with the transport of the request
    pub fn evaluate(&self, params: &RouteParams, request: &RequestContext) -> Decision {
        let requires_secure = self.requires_secure(params);
        trace!(
            "Route {params:?} requires secure transport: {requires_secure}, request is secure: {}",
            request.secure
        );

        if requires_secure == request.secure {
            return Decision::NoAction;
        }

        let Some(host) = &request.host else {
            warn!("Cannot redirect request for {}, host name unknown", request.path);
            return Decision::NoAction;
        };

        if requires_secure {
            Decision::RedirectToSecure(Self::url(
                "https",
                host,
                self.https_port.filter(|port| *port != Self::HTTPS_DEFAULT_PORT),
                &request.path,
            ))
        } else {
            Decision::RedirectToInsecure(Self::url(
                "http",
                host,
                self.http_port.filter(|port| *port != Self::HTTP_DEFAULT_PORT),
                &request.path,
            ))
        }
    }

    fn url(scheme: &str, host: &str, port: Option<u16>, path: &str) -> String {
        let mut url = match port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        url
    }
}
