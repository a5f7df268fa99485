//! Browserless-backed implementation of the browser capability.
//!
//! Sessions are virtual: actions accumulate into a step list that is
//! replayed server-side in a single `/function` call whenever the caller
//! needs an observable result (`html`, `click_by_text`) or closes the
//! session with unexecuted steps.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{Browser, BrowserError, PageSession};

const REPLAY_FUNCTION: &str = r#"
module.exports = async ({ page, context }) => {
    const { steps, settleMs } = context;
    let lastClickFound = false;
    for (const step of steps) {
        switch (step.op) {
            case "goto":
                await page.goto(step.url, { waitUntil: "networkidle2" });
                break;
            case "fill":
                await page.waitForSelector(step.selector, { timeout: 15000 });
                await page.type(step.selector, step.value);
                break;
            case "click":
                await page.waitForSelector(step.selector, { timeout: 15000 });
                await page.click(step.selector);
                break;
            case "click_by_text": {
                const needle = step.needle.toLowerCase();
                lastClickFound = await page.evaluate((text) => {
                    const nodes = Array.from(document.querySelectorAll("a, button"));
                    const hit = nodes.find((n) => (n.innerText || "").toLowerCase().includes(text));
                    if (hit) { hit.click(); return true; }
                    return false;
                }, needle);
                break;
            }
            case "scroll_by":
                await page.evaluate((px) => window.scrollBy(0, px), step.pixels);
                break;
        }
        await new Promise((resolve) => setTimeout(resolve, settleMs));
    }
    return { data: { html: await page.content(), lastClickFound }, type: "application/json" };
};
"#;

#[derive(Debug, Clone)]
pub struct BrowserlessConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Covers one full replay including page loads and settles.
    pub request_timeout: Duration,
    /// Wait inserted after every replayed action.
    pub step_settle_ms: u64,
}

impl Default for BrowserlessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            token: None,
            request_timeout: Duration::from_secs(120),
            step_settle_ms: 1_000,
        }
    }
}

pub struct BrowserlessBrowser {
    client: reqwest::Client,
    config: BrowserlessConfig,
}

impl BrowserlessBrowser {
    pub fn new(config: BrowserlessConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.token {
            Some(token) => format!("{base}/{path}?token={token}"),
            None => format!("{base}/{path}"),
        }
    }
}

#[async_trait]
impl Browser for BrowserlessBrowser {
    async fn open_session(&self) -> Result<Box<dyn PageSession>, BrowserError> {
        // A service that cannot answer /pressure will not run functions
        // either; failing here keeps the retry budget at the acquisition
        // boundary where it belongs.
        let response = self
            .client
            .get(self.endpoint("pressure"))
            .send()
            .await
            .map_err(|err| BrowserError::SessionUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(BrowserError::SessionUnavailable(format!(
                "browserless /pressure returned {}",
                response.status()
            )));
        }
        Ok(Box::new(BrowserlessSession {
            client: self.client.clone(),
            function_endpoint: self.endpoint("function"),
            settle_ms: self.config.step_settle_ms,
            steps: Vec::new(),
            dirty: false,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Step {
    Goto { url: String },
    Fill { selector: String, value: String },
    Click { selector: String },
    ClickByText { needle: String },
    ScrollBy { pixels: i64 },
}

struct BrowserlessSession {
    client: reqwest::Client,
    function_endpoint: String,
    settle_ms: u64,
    steps: Vec<Step>,
    dirty: bool,
}

struct ReplayOutcome {
    html: String,
    last_click_found: bool,
}

impl BrowserlessSession {
    fn push(&mut self, step: Step) {
        self.steps.push(step);
        self.dirty = true;
    }

    /// Replay the full step list against a fresh server-side page.
    async fn execute(&mut self) -> Result<ReplayOutcome, BrowserError> {
        debug!(steps = self.steps.len(), "replaying browserless steps");
        let body = serde_json::json!({
            "code": REPLAY_FUNCTION,
            "context": { "steps": self.steps, "settleMs": self.settle_ms },
        });
        let response = self
            .client
            .post(&self.function_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BrowserError::Script(format!(
                "browserless /function returned {status}: {message}"
            )));
        }
        let value: JsonValue = response
            .json()
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        self.dirty = false;
        Ok(ReplayOutcome {
            html: value
                .get("html")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            last_click_found: value
                .get("lastClickFound")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

#[async_trait]
impl PageSession for BrowserlessSession {
    async fn navigate(&mut self, url: &str) -> Result<(), BrowserError> {
        self.push(Step::Goto {
            url: url.to_string(),
        });
        Ok(())
    }

    async fn html(&mut self) -> Result<String, BrowserError> {
        Ok(self.execute().await?.html)
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.push(Step::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        self.push(Step::Click {
            selector: selector.to_string(),
        });
        Ok(())
    }

    async fn click_by_text(&mut self, needle: &str) -> Result<bool, BrowserError> {
        self.push(Step::ClickByText {
            needle: needle.to_string(),
        });
        Ok(self.execute().await?.last_click_found)
    }

    async fn scroll_by(&mut self, pixels: i64) -> Result<(), BrowserError> {
        self.push(Step::ScrollBy { pixels });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        if self.dirty {
            self.execute().await?;
        }
        self.steps.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The `op` tags and field names are consumed by REPLAY_FUNCTION; a
    // drift here breaks every session silently.
    #[test]
    fn step_serialization_matches_the_replay_script() {
        let steps = vec![
            Step::Goto {
                url: "https://example.com/".to_string(),
            },
            Step::Fill {
                selector: "input[name=q]".to_string(),
                value: "reels".to_string(),
            },
            Step::Click {
                selector: "button[type=submit]".to_string(),
            },
            Step::ClickByText {
                needle: "download".to_string(),
            },
            Step::ScrollBy { pixels: 900 },
        ];
        let json = serde_json::to_value(&steps).unwrap();
        assert_eq!(json[0]["op"], "goto");
        assert_eq!(json[0]["url"], "https://example.com/");
        assert_eq!(json[1]["op"], "fill");
        assert_eq!(json[1]["selector"], "input[name=q]");
        assert_eq!(json[1]["value"], "reels");
        assert_eq!(json[2]["op"], "click");
        assert_eq!(json[3]["op"], "click_by_text");
        assert_eq!(json[3]["needle"], "download");
        assert_eq!(json[4]["op"], "scroll_by");
        assert_eq!(json[4]["pixels"], 900);
    }

    #[test]
    fn endpoint_appends_token_when_configured() {
        let with_token = BrowserlessBrowser::new(BrowserlessConfig {
            token: Some("secret".to_string()),
            ..BrowserlessConfig::default()
        })
        .unwrap();
        assert_eq!(
            with_token.endpoint("function"),
            "http://localhost:3000/function?token=secret"
        );

        let without_token = BrowserlessBrowser::new(BrowserlessConfig::default()).unwrap();
        assert_eq!(
            without_token.endpoint("pressure"),
            "http://localhost:3000/pressure"
        );
    }
}
