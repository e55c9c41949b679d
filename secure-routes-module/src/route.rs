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

//! Resolution of route parameters from request paths

use percent_encoding::percent_decode_str;
use std::collections::HashSet;

/// Route parameters of a request
///
/// Request paths are resolved following the conventional `/[prefix/]controller/action/...`
/// scheme. Any further path segments are action arguments and don't affect the route.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteParams {
    /// Controller name
    pub controller: Option<String>,
    /// Action name
    pub action: Option<String>,
    /// Route prefix, e.g. `admin`
    pub prefix: Option<String>,
}

impl RouteParams {
    /// Action assumed when the path names a controller only
    pub const DEFAULT_ACTION: &'static str = "index";

    /// Creates route parameters for a controller and action without prefix
    pub fn new(controller: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            controller: Some(controller.into()),
            action: Some(action.into()),
            prefix: None,
        }
    }

    /// Sets the route prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Resolves route parameters from a request path. The first path segment is considered a
    /// route prefix only if it is contained in `prefixes`.
    pub fn from_path(path: &str, prefixes: &HashSet<String>) -> Self {
        let mut segments = path_segments(path).into_iter().peekable();

        let prefix = segments.next_if(|segment| prefixes.contains(segment));
        let controller = segments.next();
        let action = controller.as_ref().map(|_| {
            segments
                .next()
                .unwrap_or_else(|| Self::DEFAULT_ACTION.to_owned())
        });

        Self {
            controller,
            action,
            prefix,
        }
    }

    /// Controller name, empty names are treated as missing
    pub fn controller(&self) -> Option<&str> {
        non_empty(&self.controller)
    }

    /// Action name, empty names are treated as missing
    pub fn action(&self) -> Option<&str> {
        non_empty(&self.action)
    }

    /// Route prefix, empty prefixes are treated as missing
    pub fn prefix(&self) -> Option<&str> {
        non_empty(&self.prefix)
    }
}

/// Splits a path into percent-decoded segments. Empty and `.` segments are dropped, `..` removes
/// the preceding segment.
pub(crate) fn path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        let segment = percent_decode_str(segment).decode_utf8_lossy();
        match &*segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment.into_owned()),
        }
    }
    segments
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}
