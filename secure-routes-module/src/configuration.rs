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

//! Structures required to deserialize Secure Routes Module configuration from YAML configuration
//! files.

use clap::Parser;
use http::StatusCode;
use log::error;
use pandora_module_utils::pingora::{Error, ErrorType};
use pandora_module_utils::{DeserializeMap, OneOrMany};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

/// Actions of a controller that have to be served via HTTPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecuredActions {
    /// All actions of the controller, configured as `*`
    AllActions,
    /// Only the listed actions
    Actions(HashSet<String>),
}

impl SecuredActions {
    const WILDCARD: &'static str = "*";

    /// Checks whether the given action is covered
    pub fn contains(&self, action: &str) -> bool {
        match self {
            Self::AllActions => true,
            Self::Actions(actions) => actions.contains(action),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for SecuredActions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let actions: HashSet<String> = iter.into_iter().map(Into::into).collect();
        if actions.contains(Self::WILDCARD) {
            Self::AllActions
        } else {
            Self::Actions(actions)
        }
    }
}

impl<'de> Deserialize<'de> for SecuredActions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ActionsVisitor;

        impl<'de> Visitor<'de> for ActionsVisitor {
            type Value = SecuredActions;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("\"*\", an action name or a list of action names")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(std::iter::once(v).collect())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut actions = Vec::new();
                while let Some(action) = seq.next_element::<String>()? {
                    actions.push(action);
                }
                Ok(actions.into_iter().collect())
            }
        }

        deserializer.deserialize_any(ActionsVisitor)
    }
}

/// Redirect type used when the transport does not match the policy
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectType {
    /// A 302 Found response
    #[default]
    Temporary,
    /// A 301 Moved Permanently response
    Permanent,
}

impl RedirectType {
    /// HTTP status code of the redirect response
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Temporary => StatusCode::FOUND,
            Self::Permanent => StatusCode::MOVED_PERMANENTLY,
        }
    }
}

impl FromStr for RedirectType {
    type Err = Box<Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(Self::Temporary),
            "permanent" => Ok(Self::Permanent),
            _ => Err(Error::explain(
                ErrorType::InternalError,
                "invalid redirect type value",
            )),
        }
    }
}

/// Command line options of the secure routes module
#[derive(Debug, Default, Parser)]
pub struct SecureRoutesOpt {
    /// A controller to be served via HTTPS only, optionally restricted to some actions:
    /// `controller` or `controller:action1,action2`. This command line flag can be specified
    /// multiple times.
    #[clap(long)]
    pub secure_controller: Option<Vec<String>>,

    /// Evaluate the secure routes policy without redirecting requests
    #[clap(long)]
    pub secure_no_redirect: bool,

    /// Redirect type, either "temporary" or "permanent"
    #[clap(long)]
    pub secure_redirect_type: Option<RedirectType>,

    /// Server name to use in redirect targets instead of the request's host name
    #[clap(long)]
    pub secure_server_name: Option<String>,
}

/// Configuration file settings of the secure routes module
#[derive(Debug, Clone, PartialEq, Eq, DeserializeMap)]
pub struct SecureRoutesConf {
    /// Controllers with actions to be served via HTTPS only
    ///
    /// The value is either `*` (all actions), a single action name or a list of action names.
    /// Controllers not listed here will be redirected to plain HTTP.
    pub secure_controllers: HashMap<String, SecuredActions>,

    /// Route prefixes like `admin`, all routes under these are served via HTTPS only
    pub secure_prefixes: OneOrMany<String>,

    /// Further route prefixes known to the application but not requiring HTTPS
    pub secure_routing_prefixes: OneOrMany<String>,

    /// Paths not handled by the application's controllers like `/css` or `/favicon.ico`. Requests
    /// to these paths and anything below them are never redirected.
    pub secure_exclude: OneOrMany<String>,

    /// If `false`, the decision is only recorded in the session but no redirect happens
    pub secure_auto_redirect: bool,

    /// Redirect type, one of `temporary` (default) or `permanent`
    pub secure_redirect_type: RedirectType,

    /// Server name to redirect to, by default the host name of the request is used
    pub secure_server_name: Option<String>,

    /// Port to add to HTTPS redirect targets if not the default port 443
    pub secure_https_port: Option<u16>,

    /// Port to add to HTTP redirect targets if not the default port 80
    pub secure_http_port: Option<u16>,

    /// If `true`, the `X-Forwarded-Proto` request header determines whether the request is
    /// secure. Only enable this behind a proxy that sets this header.
    pub secure_trust_forwarded_proto: bool,
}

impl Default for SecureRoutesConf {
    fn default() -> Self {
        Self {
            secure_controllers: HashMap::new(),
            secure_prefixes: Default::default(),
            secure_routing_prefixes: Default::default(),
            secure_exclude: Default::default(),
            secure_auto_redirect: true,
            secure_redirect_type: Default::default(),
            secure_server_name: None,
            secure_https_port: None,
            secure_http_port: None,
            secure_trust_forwarded_proto: false,
        }
    }
}

impl SecureRoutesConf {
    /// Merges the command line options into the current configuration. Command line options
    /// present overwrite existing settings, with the exception of `--secure-controller` that adds
    /// to the existing ones.
    pub fn merge_with_opt(&mut self, opt: SecureRoutesOpt) {
        if let Some(controllers) = opt.secure_controller {
            for entry in controllers {
                match parse_controller_entry(&entry) {
                    Some((controller, actions)) => {
                        self.secure_controllers.insert(controller, actions);
                    }
                    None => error!("Invalid secure controller, expected controller[:actions]: {entry}"),
                }
            }
        }

        if opt.secure_no_redirect {
            self.secure_auto_redirect = false;
        }

        if let Some(redirect_type) = opt.secure_redirect_type {
            self.secure_redirect_type = redirect_type;
        }

        if opt.secure_server_name.is_some() {
            self.secure_server_name = opt.secure_server_name;
        }
    }
}

fn parse_controller_entry(entry: &str) -> Option<(String, SecuredActions)> {
    let (controller, actions): (&str, SecuredActions) = match entry.split_once(':') {
        Some((controller, actions)) => (
            controller,
            actions
                .split(',')
                .map(str::trim)
                .filter(|action| !action.is_empty())
                .collect(),
        ),
        None => (entry, SecuredActions::AllActions),
    };

    let controller = controller.trim();
    if controller.is_empty() || actions == SecuredActions::Actions(HashSet::new()) {
        None
    } else {
        Some((controller.to_owned(), actions))
    }
}
