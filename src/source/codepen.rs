use super::{MessageSource, RawMessage};
use crate::config::SourceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_TYPE, COOKIE, REFERER, SET_COOKIE};
use std::sync::LazyLock;
use std::time::Duration;

/// Any opening tag: `<name attrs>`. Group 1 = name, group 2 = attributes.
static OPEN_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<([a-zA-Z][a-zA-Z0-9]*)\b([^>]*)>").unwrap());

/// Opening or closing tag, used for depth-aware close matching (no backreferences).
static ANY_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<(/?)([a-zA-Z][a-zA-Z0-9]*)\b[^>]*?(/?)>").unwrap());

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([a-zA-Z_:][a-zA-Z0-9_:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

static CSRF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)csrf-token["']\s+content\s*=\s*["']([^"']+)["']"#).unwrap()
});

static AVATAR_USER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cdpn\.io/(\d+)").unwrap());

const COMMENT_ID_PREFIX: &str = "comment-id-";

/// Comments on a single CodePen pen, read from the pen's details page and
/// deleted through the owner's logged-in session.
///
/// The session cookie is supplied by the operator. `refresh_session` exchanges
/// it for a CSRF token and response cookies, which deletion requires.
pub struct CodePenSource {
    base_url: String,
    user: String,
    pen_id: String,
    session_cookie: String,
    session: RwLock<SessionState>,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    csrf_token: Option<String>,
    cookies: Option<String>,
}

impl CodePenSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("Failed to build CodePen HTTP client")?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user: config.user.trim().to_string(),
            pen_id: config.pen_id.trim().to_string(),
            session_cookie: config.session_cookie.trim().to_string(),
            session: RwLock::new(SessionState::default()),
            client,
        })
    }

    fn pen_url(&self) -> String {
        format!("{}/{}/pen/{}", self.base_url, self.user, self.pen_id)
    }

    fn details_url(&self) -> String {
        format!("{}/{}/details/{}", self.base_url, self.user, self.pen_id)
    }

    fn delete_url(&self, comment_id: &str) -> String {
        format!("{}/comment/delete/pen/{}", self.base_url, comment_id)
    }

    /// Whether a CSRF token is currently held.
    pub fn has_session(&self) -> bool {
        self.session.read().csrf_token.is_some()
    }
}

#[async_trait]
impl MessageSource for CodePenSource {
    fn name(&self) -> &str {
        "codepen"
    }

    async fn fetch_all(&self) -> Result<Vec<RawMessage>> {
        let body = self
            .client
            .get(self.details_url())
            .header(COOKIE, &self.session_cookie)
            .send()
            .await
            .context("Failed to load pen details page")?
            .error_for_status()
            .context("Pen details page returned an error status")?
            .text()
            .await
            .context("Failed to read pen details page")?;

        Ok(parse_comments(&body))
    }

    async fn delete(&self, message_id: &str) -> Result<()> {
        let message_id = message_id.trim();
        if message_id.is_empty() {
            anyhow::bail!("comment id required");
        }

        let session = self.session.read().clone();
        let csrf_token = session
            .csrf_token
            .context("CodePen session not initialised; refresh_session has not succeeded yet")?;
        let cookies = session
            .cookies
            .unwrap_or_else(|| self.session_cookie.clone());

        let response = self
            .client
            .post(self.delete_url(message_id))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header("x-csrf-token", csrf_token)
            .header(REFERER, self.pen_url())
            .header(COOKIE, cookies)
            .send()
            .await
            .with_context(|| format!("Failed to send delete for comment {message_id}"))?
            .error_for_status()
            .with_context(|| format!("Delete of comment {message_id} was refused"))?;

        let body: serde_json::Value = response
            .json()
            .await
            .context("Delete response was not JSON")?;
        if body.get("success").and_then(serde_json::Value::as_bool) != Some(true) {
            anyhow::bail!("Couldn't delete comment {message_id}");
        }
        Ok(())
    }

    async fn refresh_session(&self) -> Result<()> {
        let response = self
            .client
            .get(self.pen_url())
            .header(COOKIE, &self.session_cookie)
            .send()
            .await
            .context("Failed to load pen page")?
            .error_for_status()
            .context("Pen page returned an error status")?;

        let cookies = collect_cookies(response.headers());
        let body = response.text().await.context("Failed to read pen page")?;
        let csrf_token = extract_csrf_token(&body).context(
            "CSRF token not found on pen page; the session cookie may have expired",
        )?;

        *self.session.write() = SessionState {
            csrf_token: Some(csrf_token),
            cookies,
        };
        tracing::info!(pen = %self.pen_id, "CodePen session refreshed");
        Ok(())
    }
}

/// Join the `name=value` parts of every `Set-Cookie` header into a `Cookie` value.
fn collect_cookies(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|c| c.split(';').next())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

fn extract_csrf_token(html: &str) -> Option<String> {
    CSRF_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract every `.group.comment` block from a pen details page.
///
/// Blocks without a `comment-id-*` id are skipped: they cannot be deleted and
/// would otherwise be re-read on every poll.
pub fn parse_comments(html: &str) -> Vec<RawMessage> {
    let starts: Vec<(usize, &str)> = OPEN_TAG_RE
        .captures_iter(html)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let attrs = c.get(2)?.as_str();
            (has_class(attrs, "group") && has_class(attrs, "comment"))
                .then_some((whole.start(), attrs))
        })
        .collect();

    let mut messages = Vec::with_capacity(starts.len());
    for (i, (start, attrs)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(html.len(), |(next, _)| *next);
        let block = &html[*start..end];

        let Some(id) = attr(attrs, "id")
            .and_then(|id| id.strip_prefix(COMMENT_ID_PREFIX))
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            tracing::warn!("Skipping comment block without a comment id");
            continue;
        };

        let raw_text = element_text(block, None, "comment-text").unwrap_or_default();
        let handle = element_text(block, Some("span"), "username").unwrap_or_default();
        let poster_handle = handle.strip_prefix('@').unwrap_or(&handle).to_string();
        let display_name = element_text(block, None, "comment-username").unwrap_or_default();
        let poster_id = element_attr(block, "comment-avatar", "src").and_then(|src| {
            AVATAR_USER_ID_RE
                .captures(&src)
                .and_then(|c| c[1].parse::<u64>().ok())
        });

        messages.push(RawMessage {
            id: id.to_string(),
            raw_text,
            poster_id,
            poster_handle,
            display_name,
        });
    }
    messages
}

fn attr<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    ATTR_RE.captures_iter(attrs).find_map(|c| {
        let key = c.get(1)?.as_str();
        if !key.eq_ignore_ascii_case(name) {
            return None;
        }
        c.get(2).or_else(|| c.get(3)).map(|m| m.as_str())
    })
}

fn has_class(attrs: &str, class: &str) -> bool {
    attr(attrs, "class").is_some_and(|value| value.split_whitespace().any(|c| c == class))
}

/// Text content of the first element in `block` carrying `class`.
fn element_text(block: &str, tag: Option<&str>, class: &str) -> Option<String> {
    let caps = OPEN_TAG_RE.captures_iter(block).find(|c| {
        let name_matches = tag.map_or(true, |t| c[1].eq_ignore_ascii_case(t));
        name_matches && has_class(&c[2], class)
    })?;
    let name = caps.get(1)?.as_str();
    let inner_start = caps.get(0)?.end();
    let rest = &block[inner_start..];
    let inner_end = find_closing_tag(rest, name).unwrap_or(rest.len());

    let text = nanohtml2text::html2text(&rest[..inner_end]);
    Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn element_attr(block: &str, class: &str, name: &str) -> Option<String> {
    OPEN_TAG_RE
        .captures_iter(block)
        .find(|c| has_class(&c[2], class))
        .and_then(|c| attr(c.get(2)?.as_str(), name).map(nanohtml2text::html2text))
}

/// Byte offset of the `</tag>` that closes an element whose content starts `rest`.
fn find_closing_tag(rest: &str, tag: &str) -> Option<usize> {
    let mut depth = 1usize;
    for c in ANY_TAG_RE.captures_iter(rest) {
        if !c[2].eq_ignore_ascii_case(tag) {
            continue;
        }
        let closing = !c[1].is_empty();
        let self_closing = !c[3].is_empty();
        if closing {
            depth -= 1;
            if depth == 0 {
                return c.get(0).map(|m| m.start());
            }
        } else if !self_closing {
            depth += 1;
        }
    }
    None
}
