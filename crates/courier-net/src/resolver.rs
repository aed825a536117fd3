//! Endpoint resolution.
//!
//! An [`EndpointResolver`] turns a descriptor into a fully qualified URL.
//! [`TemplateResolver`] is the default: it expands `{name}` placeholders in
//! the descriptor's path, appends the segments to the configured base URL
//! and adds the query pairs.

use url::Url;

use crate::config::ConnectionSettings;
use crate::error::{NetworkError, Result};
use crate::request::RequestDescriptor;

/// Builds the endpoint URL for a descriptor. Must be pure.
pub trait EndpointResolver: Send + Sync {
    /// Resolve a descriptor against the connection settings.
    fn resolve(&self, descriptor: &RequestDescriptor, settings: &ConnectionSettings) -> Result<Url>;
}

/// Resolves path templates against the configured base URL.
///
/// - A path that is already an absolute `http`/`https` URL is used as-is.
/// - Otherwise the path is split on `/`, each `{name}` placeholder is
///   replaced by the matching path parameter, and every segment is
///   percent-encoded and appended to the base URL's path. Empty segments are
///   skipped.
/// - Query pairs are appended in insertion order.
///
/// Missing parameters, unbalanced braces, whitespace or control characters,
/// and `?` or `#` in the template are rejected, as is any segment that is
/// `.` or `..` after expansion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver;

impl EndpointResolver for TemplateResolver {
    fn resolve(&self, descriptor: &RequestDescriptor, settings: &ConnectionSettings) -> Result<Url> {
        let path = descriptor.path();
        let mut url = if is_absolute(path) {
            Url::parse(path)
                .map_err(|e| NetworkError::UrlBuild(format!("invalid URL '{path}': {e}")))?
        } else {
            let segments = expand_template(path, descriptor)?;
            let base = settings
                .base_url
                .as_ref()
                .ok_or_else(|| NetworkError::UrlBuild("no base URL configured".into()))?;
            let mut url = base.clone();
            {
                let mut path_segments = url.path_segments_mut().map_err(|()| {
                    NetworkError::UrlBuild(format!("base URL '{base}' cannot be a base"))
                })?;
                path_segments.pop_if_empty();
                for segment in &segments {
                    path_segments.push(segment);
                }
            }
            url
        };

        if !descriptor.query().is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in descriptor.query() {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

fn is_absolute(path: &str) -> bool {
    let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn expand_template(template: &str, descriptor: &RequestDescriptor) -> Result<Vec<String>> {
    if let Some(c) = template
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == '?' || *c == '#')
    {
        return Err(NetworkError::UrlBuild(format!(
            "invalid character {c:?} in path '{template}'"
        )));
    }

    template
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let expanded = expand_segment(segment, template, descriptor)?;
            if expanded == "." || expanded == ".." {
                return Err(NetworkError::UrlBuild(format!(
                    "dot segment {expanded:?} in path '{template}'"
                )));
            }
            Ok(expanded)
        })
        .collect()
}

fn expand_segment(segment: &str, template: &str, descriptor: &RequestDescriptor) -> Result<String> {
    let unbalanced = || NetworkError::UrlBuild(format!("unbalanced braces in path '{template}'"));

    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(open) = rest.find(['{', '}']) {
        if rest[open..].starts_with('}') {
            return Err(unbalanced());
        }
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(unbalanced)?;
        let name = &after[..close];
        if name.is_empty() || name.contains('{') {
            return Err(unbalanced());
        }
        let value = descriptor.path_param(name).ok_or_else(|| {
            NetworkError::UrlBuild(format!("missing path parameter '{name}' for '{template}'"))
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: &str) -> ConnectionSettings {
        ConnectionSettings {
            base_url: Some(Url::parse(base).unwrap()),
            ..Default::default()
        }
    }

    fn resolve(descriptor: RequestDescriptor, base: &str) -> Result<Url> {
        TemplateResolver.resolve(&descriptor, &settings(base))
    }

    #[test]
    fn test_appends_path_to_base() {
        let url = resolve(
            RequestDescriptor::get("/widgets/{id}").path_param("id", 7).build(),
            "https://api.example.com/v1/",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/widgets/7");

        let url = resolve(
            RequestDescriptor::get("status").build(),
            "https://api.example.com",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/status");
    }

    #[test]
    fn test_placeholder_inside_segment() {
        let url = resolve(
            RequestDescriptor::get("/files/{name}.{ext}")
                .path_param("name", "report")
                .path_param("ext", "pdf")
                .build(),
            "https://api.example.com",
        )
        .unwrap();
        assert_eq!(url.path(), "/files/report.pdf");
    }

    #[test]
    fn test_parameters_are_percent_encoded() {
        let url = resolve(
            RequestDescriptor::get("/users/{name}")
                .path_param("name", "a b/c")
                .build(),
            "https://api.example.com",
        )
        .unwrap();
        assert_eq!(url.path(), "/users/a%20b%2Fc");
    }

    #[test]
    fn test_query_pairs_in_order() {
        let url = resolve(
            RequestDescriptor::get("/search")
                .query("q", "rust & tokio")
                .query("page", 2)
                .build(),
            "https://api.example.com",
        )
        .unwrap();
        assert_eq!(url.query(), Some("q=rust+%26+tokio&page=2"));
    }

    #[test]
    fn test_absolute_path_used_as_is() {
        let url = TemplateResolver
            .resolve(
                &RequestDescriptor::get("https://cdn.example.com/a.png?v=1")
                    .query("w", 64)
                    .build(),
                &ConnectionSettings::default(),
            )
            .unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/a.png?v=1&w=64");
    }

    #[test]
    fn test_missing_base_url() {
        let err = TemplateResolver
            .resolve(&RequestDescriptor::get("/x").build(), &ConnectionSettings::default())
            .unwrap_err();
        assert!(matches!(err, NetworkError::UrlBuild(msg) if msg.contains("base URL")));
    }

    #[test]
    fn test_missing_parameter() {
        let err = resolve(
            RequestDescriptor::get("/widgets/{id}").build(),
            "https://api.example.com",
        )
        .unwrap_err();
        assert!(matches!(err, NetworkError::UrlBuild(msg) if msg.contains("'id'")));
    }

    #[test]
    fn test_rejects_malformed_templates() {
        for template in [
            "/widgets/{id",
            "/widgets/id}",
            "/widgets/{}",
            "/widgets/{{id}}",
            "/has space",
            "/query?x=1",
            "/frag#top",
        ] {
            let err = resolve(
                RequestDescriptor::get(template).path_param("id", 1).build(),
                "https://api.example.com",
            )
            .unwrap_err();
            assert!(
                matches!(err, NetworkError::UrlBuild(_)),
                "template {template:?} should fail"
            );
        }
    }

    #[test]
    fn test_rejects_dot_segments() {
        for template in ["/users/./sessions", "/users/../sessions"] {
            let err = resolve(RequestDescriptor::get(template).build(), "https://api.example.com/v1/")
                .unwrap_err();
            assert!(matches!(err, NetworkError::UrlBuild(_)), "template {template:?} should fail");
        }

        for id in [".", ".."] {
            let err = resolve(
                RequestDescriptor::delete("/users/{id}/sessions")
                    .path_param("id", id)
                    .build(),
                "https://api.example.com/v1/",
            )
            .unwrap_err();
            assert!(matches!(err, NetworkError::UrlBuild(_)), "id {id:?} should fail");
        }

        // Dots inside a segment are ordinary characters.
        let url = resolve(
            RequestDescriptor::get("/files/{name}")
                .path_param("name", "..hidden")
                .build(),
            "https://api.example.com/v1/",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/files/..hidden");
    }

    #[test]
    fn test_base_that_cannot_be_a_base() {
        let err = resolve(RequestDescriptor::get("/x").build(), "mailto:ops@example.com").unwrap_err();
        assert!(matches!(err, NetworkError::UrlBuild(_)));
    }
}
