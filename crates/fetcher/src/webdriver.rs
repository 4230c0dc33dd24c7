use std::time::Duration;

use async_trait::async_trait;
use thirtyfour::prelude::*;
use thirtyfour::ChromeCapabilities;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::pool::{BrowserSession, Rendered, SessionFactory};
use crate::{FetchError, PageRequest, WaitFor};

pub const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const ELEMENT_WAIT: Duration = Duration::from_secs(30);

/// Opens headless Chrome sessions on a running WebDriver server (chromedriver).
#[derive(Debug, Clone)]
pub struct WebDriverFactory {
    server_url: String,
    user_agent: String,
    window: (u32, u32),
}

impl WebDriverFactory {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window: (1280, 900),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn capabilities(&self) -> WebDriverResult<ChromeCapabilities> {
        let mut caps = DesiredCapabilities::chrome();
        caps.set_headless()?;
        caps.add_arg("--no-sandbox")?;
        caps.add_arg("--disable-dev-shm-usage")?;
        caps.add_arg(&format!("--window-size={},{}", self.window.0, self.window.1))?;
        caps.add_arg(&format!("--user-agent={}", self.user_agent))?;
        Ok(caps)
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, FetchError> {
        let caps = self
            .capabilities()
            .map_err(|err| FetchError::SessionUnavailable(err.to_string()))?;
        let driver = WebDriver::new(self.server_url.as_str(), caps)
            .await
            .map_err(|err| FetchError::SessionUnavailable(err.to_string()))?;
        debug!(server = %self.server_url, "browser session opened");
        Ok(Box::new(WebDriverSession { driver }))
    }
}

struct WebDriverSession {
    driver: WebDriver,
}

impl WebDriverSession {
    async fn wait_ready_state(&self) -> WebDriverResult<()> {
        loop {
            let ret = self
                .driver
                .execute("return document.readyState", Vec::new())
                .await?;
            if ret.json().as_str() == Some("complete") {
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn render(&mut self, request: &PageRequest) -> Result<Rendered, FetchError> {
        let nav = |err: WebDriverError| FetchError::Navigation {
            url: request.url.clone(),
            reason: err.to_string(),
        };

        self.driver.goto(request.url.as_str()).await.map_err(nav)?;
        for wait in &request.wait {
            match wait {
                WaitFor::ReadyState => self.wait_ready_state().await.map_err(nav)?,
                WaitFor::Element { selector } => {
                    self.driver
                        .query(By::Css(selector.as_str()))
                        .wait(ELEMENT_WAIT, POLL_INTERVAL)
                        .first()
                        .await
                        .map_err(nav)?;
                }
                WaitFor::Settle { millis } => sleep(Duration::from_millis(*millis)).await,
            }
        }

        let html = self.driver.source().await.map_err(nav)?;
        let url = self
            .driver
            .current_url()
            .await
            .map(|url| url.to_string())
            .unwrap_or_else(|_| request.url.clone());
        Ok(Rendered { url, html })
    }

    async fn close(&mut self) {
        if let Err(err) = self.driver.clone().quit().await {
            warn!(error = %err, "failed to quit browser session");
        }
    }
}
