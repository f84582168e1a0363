//! Parameterised request router
//!
//! Routes are inserted into a trie of path segments. A segment is either a
//! constant (`messages`, or the wildcard `*`), or a parameter written
//! `{name}` / `{name:int}` / `{name:float}`. Matching walks the trie in
//! lock-step with the request path, children before a node's own terminal,
//! first success wins; parameter values are collected into a reusable
//! scratch vector and popped on backtrack.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;

use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Head,
    Patch,
    Delete,
    Options,
}

const METHOD_COUNT: usize = 7;

impl Method {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "HEAD" => Some(Self::Head),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    #[inline]
    fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        })
    }
}

/// A future-returning handler runs as a suspendable task; a blocking one
/// must build its response before returning.
pub enum Handler {
    Blocking(Box<dyn Fn(HttpRequest, HttpResponse) + Send + Sync>),
    Suspendable(
        Box<dyn Fn(HttpRequest, HttpResponse) -> Pin<Box<dyn Future<Output = ()>>> + Send + Sync>,
    ),
}

impl Handler {
    pub fn blocking(f: impl Fn(HttpRequest, HttpResponse) + Send + Sync + 'static) -> Self {
        Self::Blocking(Box::new(f))
    }

    pub fn suspendable<F, Fut>(f: F) -> Self
    where
        F: Fn(HttpRequest, HttpResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::Suspendable(Box::new(move |req, res| Box::pin(f(req, res))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Root,
    Constant,
    ParamInt,
    ParamFloat,
    ParamString,
}

#[derive(Debug)]
struct RouteNode {
    kind: SegmentKind,
    label: String,
    terminal: bool,
    methods: u32,
    route_index: [usize; METHOD_COUNT],
    children: Vec<RouteNode>,
}

impl RouteNode {
    fn root() -> Self {
        Self::new(SegmentKind::Root, String::new())
    }

    fn new(kind: SegmentKind, label: String) -> Self {
        Self {
            kind,
            label,
            terminal: false,
            methods: 0,
            route_index: [usize::MAX; METHOD_COUNT],
            children: Vec::new(),
        }
    }

    fn matches_data(&self, kind: SegmentKind, label: &str) -> bool {
        self.kind == kind && (kind == SegmentKind::Root || self.label == label)
    }

    fn insert_path(&mut self, method: Method, path: &str, index: usize) {
        self.methods |= method.bit();

        debug_assert!(path.starts_with('/'));
        let end = path[1..].find('/').map(|p| p + 1);
        let level = &path[1..end.unwrap_or(path.len())];
        let next_path = end.map_or("/", |e| &path[e..]);

        if level.is_empty() {
            // "/" registered on the root itself
            debug_assert!(self.kind == SegmentKind::Root, "route segment cannot be empty");
            self.terminal = true;
            self.route_index[method as usize] = index;
            return;
        }

        let (kind, label) = parse_segment(level);
        let is_terminal = next_path == "/";

        let child = match self.children.iter_mut().position(|c| c.matches_data(kind, label)) {
            Some(at) => &mut self.children[at],
            None => {
                self.children.push(RouteNode::new(kind, label.to_string()));
                self.children.last_mut().expect("just pushed")
            }
        };
        if is_terminal {
            child.terminal = true;
            child.methods |= method.bit();
            child.route_index[method as usize] = index;
        } else {
            child.insert_path(method, next_path, index);
        }
    }

    /// `at` is the byte offset of `path` within the full request path, so
    /// parameter values can be reported as ranges into it.
    fn match_path(
        &self,
        method: Method,
        full: &str,
        at: usize,
        vars: &mut Vec<(usize, usize)>,
    ) -> Option<usize> {
        if self.methods & method.bit() == 0 {
            return None;
        }

        let path = &full[at..];
        debug_assert!(path.starts_with('/'));
        let end = path[1..].find('/').map(|p| p + 1);
        let level = &path[1..end.unwrap_or(path.len())];
        let mut next_at = end.map_or(full.len(), |e| at + e);

        let pushed = match self.kind {
            SegmentKind::Root => {
                next_at = at;
                false
            }
            SegmentKind::Constant => {
                if self.label != "*" && self.label != level {
                    return None;
                }
                false
            }
            SegmentKind::ParamInt => {
                if level.is_empty() || !level.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                vars.push((at + 1, level.len()));
                true
            }
            SegmentKind::ParamFloat => {
                let mut dots = 0;
                if level.is_empty() {
                    return None;
                }
                for b in level.bytes() {
                    if b == b'.' {
                        dots += 1;
                        if dots > 1 {
                            return None;
                        }
                    } else if !b.is_ascii_digit() {
                        return None;
                    }
                }
                vars.push((at + 1, level.len()));
                true
            }
            SegmentKind::ParamString => {
                if level.is_empty() {
                    return None;
                }
                vars.push((at + 1, level.len()));
                true
            }
        };

        let consumed = next_at >= full.len() || &full[next_at..] == "/";
        if !consumed {
            for child in &self.children {
                if let Some(found) = child.match_path(method, full, next_at, vars) {
                    return Some(found);
                }
            }
        }

        if self.terminal && consumed {
            let index = self.route_index[method as usize];
            if index != usize::MAX {
                return Some(index);
            }
        }

        if pushed {
            vars.pop();
        }
        None
    }
}

fn parse_segment(level: &str) -> (SegmentKind, &str) {
    if level.starts_with('{') && level.ends_with('}') {
        let inner = &level[1..level.len() - 1];
        match inner.split_once(':') {
            Some((name, "int")) => (SegmentKind::ParamInt, name),
            Some((name, "float")) => (SegmentKind::ParamFloat, name),
            Some((name, _)) => (SegmentKind::ParamString, name),
            None => (SegmentKind::ParamString, inner),
        }
    } else {
        (SegmentKind::Constant, level)
    }
}

/// Trie-matched `(method, path) → handler` table. Built once at startup and
/// shared read-only by every worker.
pub struct Router {
    root: RouteNode,
    handlers: Vec<Handler>,
    param_names: Vec<Vec<String>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            root: RouteNode::root(),
            handlers: Vec::new(),
            param_names: Vec::new(),
        }
    }

    pub fn add_route(&mut self, method: Method, path: &str, handler: Handler) {
        let index = self.handlers.len();
        self.handlers.push(handler);
        self.param_names.push(
            path.split('/')
                .filter(|s| s.starts_with('{') && s.ends_with('}'))
                .map(|s| parse_segment(s).1.to_string())
                .collect(),
        );
        self.root.insert_path(method, path, index);
    }

    /// Matches `path`, filling `scratch` with `(offset, len)` parameter
    /// ranges in trie-position order. Only one match runs per worker at a
    /// time, so the scratch vector is reused across requests.
    pub fn match_route(
        &self,
        method: Method,
        path: &str,
        scratch: &mut Vec<(usize, usize)>,
    ) -> Option<usize> {
        scratch.clear();
        if path.is_empty() {
            return None;
        }
        self.root.match_path(method, path, 0, scratch)
    }

    pub fn handler(&self, index: usize) -> &Handler {
        &self.handlers[index]
    }

    /// Resolves matched parameter ranges to owned `(name, value)` pairs.
    /// Values are copied out so they survive handler suspension.
    pub fn params(&self, index: usize, path: &str, scratch: &[(usize, usize)]) -> Vec<(String, String)> {
        self.param_names[index]
            .iter()
            .zip(scratch.iter())
            .map(|(name, &(at, len))| (name.clone(), path[at..at + len].to_string()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Handler, Method, Router};

    fn noop() -> Handler {
        Handler::blocking(|_req, _res| {})
    }

    fn matched(router: &Router, method: Method, path: &str) -> Option<(usize, Vec<(String, String)>)> {
        let mut scratch = Vec::new();
        let index = router.match_route(method, path, &mut scratch)?;
        let params = router.params(index, path, &scratch);
        Some((index, params))
    }

    #[test]
    fn typed_int_param_matches_digits_only() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/api/{id:int}/messages", noop());

        let (index, params) = matched(&router, Method::Get, "/api/42/messages").unwrap();
        assert_eq!(0, index);
        assert_eq!(vec![("id".to_string(), "42".to_string())], params);

        assert!(matched(&router, Method::Get, "/api/42x/messages").is_none());
        assert!(matched(&router, Method::Get, "/api/42/messages/extra").is_none());
    }

    #[test]
    fn multiple_params_resolve_in_path_order() {
        let mut router = Router::new();
        router.add_route(Method::Post, "/api/{id:int}/messages/{to:int}/{text}", noop());

        let (_, params) = matched(&router, Method::Post, "/api/7/messages/9/hello").unwrap();
        assert_eq!(
            vec![
                ("id".to_string(), "7".to_string()),
                ("to".to_string(), "9".to_string()),
                ("text".to_string(), "hello".to_string()),
            ],
            params
        );
    }

    #[test]
    fn method_mismatch_is_not_a_match() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/things", noop());
        assert!(matched(&router, Method::Post, "/things").is_none());
        assert!(matched(&router, Method::Get, "/things").is_some());
    }

    #[test]
    fn root_path_can_be_terminal() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/", noop());
        assert_eq!(0, matched(&router, Method::Get, "/").unwrap().0);
    }

    #[test]
    fn wildcard_segment_matches_any_single_segment() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/files/*/raw", noop());
        assert!(matched(&router, Method::Get, "/files/abc/raw").is_some());
        assert!(matched(&router, Method::Get, "/files/abc/def/raw").is_none());
    }

    #[test]
    fn float_param_allows_at_most_one_dot() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/scale/{f:float}", noop());
        assert!(matched(&router, Method::Get, "/scale/1.25").is_some());
        assert!(matched(&router, Method::Get, "/scale/125").is_some());
        assert!(matched(&router, Method::Get, "/scale/1.2.5").is_none());
        assert!(matched(&router, Method::Get, "/scale/x25").is_none());
    }

    #[test]
    fn backtracking_pops_params_from_failed_branches() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/a/{x}/end", noop());
        router.add_route(Method::Get, "/a/b/{y}", noop());

        // first branch consumes {x} then fails on the tail; the second
        // branch must see a clean scratch
        let (index, params) = matched(&router, Method::Get, "/a/b/c").unwrap();
        assert_eq!(1, index);
        assert_eq!(vec![("y".to_string(), "c".to_string())], params);
    }

    #[test]
    fn constant_beats_nothing_but_insertion_order_decides_first_success() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/v/{s}", noop());
        router.add_route(Method::Get, "/v/fixed", noop());
        // param route was inserted first and string params match anything
        assert_eq!(0, matched(&router, Method::Get, "/v/fixed").unwrap().0);
        assert_eq!(0, matched(&router, Method::Get, "/v/other").unwrap().0);
    }

    #[test]
    fn distinct_methods_share_a_terminal_node() {
        let mut router = Router::new();
        router.add_route(Method::Get, "/api/thing", noop());
        router.add_route(Method::Delete, "/api/thing", noop());
        assert_eq!(0, matched(&router, Method::Get, "/api/thing").unwrap().0);
        assert_eq!(1, matched(&router, Method::Delete, "/api/thing").unwrap().0);
    }
}
