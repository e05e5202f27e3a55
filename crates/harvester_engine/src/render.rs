//! Browser-rendered page text for pages a plain fetch cannot satisfy.
//!
//! One long-lived browser session is shared by the whole process. It is
//! launched on first use and every render holds the session lock for its full
//! duration, so only one page is ever open at a time.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_logging::{engine_debug, engine_info, engine_warn};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::Page;

use crate::fetch::DEFAULT_USER_AGENT;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("rendering session is closed")]
    Closed,
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("render timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Fully rendered HTML of `url`. `wait_selector` is awaited for at most
    /// `timeout`; its absence is not an error.
    async fn render_url(
        &self,
        url: &str,
        wait_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<String, RenderError>;

    async fn reconnect(&self) -> Result<(), RenderError>;

    /// Release the session. Idempotent; later renders fail with `Closed`.
    async fn close(&self) -> Result<(), RenderError>;

    fn is_closed(&self) -> bool;
}

/// Starts browser sessions.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, RenderError>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError>;
    async fn reconnect(&mut self) -> Result<(), RenderError>;
    async fn close(&mut self) -> Result<(), RenderError>;
}

#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), RenderError>;
    async fn navigate(&self, url: &str) -> Result<(), RenderError>;
    async fn wait_for_load(&self) -> Result<(), RenderError>;
    async fn has_element(&self, selector: &str) -> bool;
    async fn content(&self) -> Result<String, RenderError>;
    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub user_agent: String,
    /// Pause after load so a challenge script can finish.
    pub challenge_settle: Duration,
    /// Pause before reading content, for deferred script output.
    pub content_settle: Duration,
    pub selector_poll_interval: Duration,
    /// Upper bound for navigation plus load.
    pub navigation_timeout: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            challenge_settle: Duration::from_secs(5),
            content_settle: Duration::from_secs(3),
            selector_poll_interval: Duration::from_millis(500),
            navigation_timeout: Duration::from_secs(60),
        }
    }
}

enum Slot {
    Vacant,
    Open(Box<dyn BrowserSession>),
    Closed,
}

pub struct RenderingFallback {
    backend: Arc<dyn BrowserBackend>,
    settings: RenderSettings,
    slot: Mutex<Slot>,
    closed: AtomicBool,
}

impl RenderingFallback {
    pub fn new(backend: Arc<dyn BrowserBackend>, settings: RenderSettings) -> Self {
        Self {
            backend,
            settings,
            slot: Mutex::new(Slot::Vacant),
            closed: AtomicBool::new(false),
        }
    }

    async fn open_page(&self, slot: &mut Slot) -> Result<Box<dyn RenderPage>, RenderError> {
        if matches!(slot, Slot::Vacant) {
            engine_info!("render launching browser session");
            *slot = Slot::Open(self.backend.launch().await?);
        }
        let Slot::Open(session) = slot else {
            return Err(RenderError::Closed);
        };

        match session.new_page().await {
            Ok(page) => Ok(page),
            Err(err) => {
                engine_warn!("render new page failed, reconnecting error={}", err);
                session.reconnect().await?;
                session.new_page().await
            }
        }
    }

    async fn drive(
        &self,
        page: &dyn RenderPage,
        url: &str,
        wait_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<String, RenderError> {
        if let Err(err) = page.set_user_agent(&self.settings.user_agent).await {
            engine_warn!("render user agent override failed url={} error={}", url, err);
        }

        let navigation = async {
            page.navigate(url).await?;
            page.wait_for_load().await
        };
        tokio::time::timeout(self.settings.navigation_timeout, navigation)
            .await
            .map_err(|_| RenderError::Timeout(self.settings.navigation_timeout))??;

        tokio::time::sleep(self.settings.challenge_settle).await;

        if let Some(selector) = wait_selector {
            if !self.wait_for_selector(page, selector, timeout).await {
                engine_debug!(
                    "render selector not found url={} selector={} timeout={:?}",
                    url,
                    selector,
                    timeout
                );
            }
        }

        tokio::time::sleep(self.settings.content_settle).await;
        page.content().await
    }

    async fn wait_for_selector(
        &self,
        page: &dyn RenderPage,
        selector: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if page.has_element(selector).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.selector_poll_interval).await;
        }
    }
}

/// Page that is closed in the background if the render is dropped before it
/// finishes, so an abandoned render never leaves a tab in the shared session.
struct OpenPage(Option<Box<dyn RenderPage>>);

impl OpenPage {
    fn new(page: Box<dyn RenderPage>) -> Self {
        Self(Some(page))
    }

    fn get(&self) -> Option<&dyn RenderPage> {
        self.0.as_deref()
    }

    async fn close(mut self) -> Result<(), RenderError> {
        match self.0.take() {
            Some(page) => page.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for OpenPage {
    fn drop(&mut self) {
        let Some(page) = self.0.take() else {
            return;
        };
        engine_debug!("render abandoned, closing page in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = page.close().await {
                        engine_warn!("render abandoned page close failed error={}", err);
                    }
                });
            }
            Err(_) => engine_warn!("render abandoned page left open, no runtime to close it"),
        }
    }
}

#[async_trait]
impl PageRenderer for RenderingFallback {
    async fn render_url(
        &self,
        url: &str,
        wait_selector: Option<&str>,
        timeout: Duration,
    ) -> Result<String, RenderError> {
        let mut slot = self.slot.lock().await;
        if matches!(*slot, Slot::Closed) {
            return Err(RenderError::Closed);
        }

        let page = OpenPage::new(self.open_page(&mut slot).await?);
        let result = match page.get() {
            Some(open) => self.drive(open, url, wait_selector, timeout).await,
            None => Err(RenderError::Closed),
        };
        if let Err(err) = page.close().await {
            engine_warn!("render page close failed url={} error={}", url, err);
        }

        match &result {
            Ok(html) => engine_info!("render done url={} bytes={}", url, html.len()),
            Err(err) => engine_warn!("render failed url={} error={}", url, err),
        }
        result
    }

    async fn reconnect(&self) -> Result<(), RenderError> {
        let mut slot = self.slot.lock().await;
        match &mut *slot {
            Slot::Closed => Err(RenderError::Closed),
            Slot::Open(session) => session.reconnect().await,
            Slot::Vacant => {
                *slot = Slot::Open(self.backend.launch().await?);
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), RenderError> {
        let mut slot = self.slot.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Open(mut session) => {
                engine_info!("render closing browser session");
                session.close().await
            }
            Slot::Vacant | Slot::Closed => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumSettings {
    pub headless: bool,
    pub proxy_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ChromiumSettings {
    fn default() -> Self {
        Self {
            headless: true,
            proxy_url: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Launches a local Chromium through the DevTools protocol.
#[derive(Debug, Clone, Default)]
pub struct ChromiumBackend {
    settings: ChromiumSettings,
}

impl ChromiumBackend {
    pub fn new(settings: ChromiumSettings) -> Self {
        Self { settings }
    }

    fn config(&self) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.settings.request_timeout)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage");
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(proxy) = self.settings.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        builder.build().map_err(RenderError::Launch)
    }
}

#[async_trait]
impl BrowserBackend for ChromiumBackend {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        let (browser, handler) = Browser::launch(self.config()?)
            .await
            .map_err(|err| RenderError::Launch(err.to_string()))?;
        Ok(Box::new(ChromiumSession {
            browser,
            handler: spawn_handler(handler),
        }))
    }
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                engine_debug!("render devtools handler error={}", err);
            }
        }
    })
}

fn browser_error(err: chromiumoxide::error::CdpError) -> RenderError {
    RenderError::Browser(err.to_string())
}

struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(browser_error)?;
        Ok(Box::new(ChromiumPage { page }))
    }

    async fn reconnect(&mut self) -> Result<(), RenderError> {
        let address = self.browser.websocket_address().clone();
        engine_info!("render reconnecting devtools address={}", address);
        let (browser, handler) = Browser::connect(address).await.map_err(browser_error)?;
        self.handler.abort();
        self.browser = browser;
        self.handler = spawn_handler(handler);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        let closed = self.browser.close().await.map(|_| ()).map_err(browser_error);
        if let Err(err) = self.browser.wait().await {
            engine_debug!("render browser wait error={}", err);
        }
        self.handler.abort();
        closed
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), RenderError> {
        self.page
            .set_user_agent(SetUserAgentOverrideParams::new(user_agent))
            .await
            .map(|_| ())
            .map_err(browser_error)
    }

    async fn navigate(&self, url: &str) -> Result<(), RenderError> {
        self.page.goto(url).await.map(|_| ()).map_err(browser_error)
    }

    async fn wait_for_load(&self) -> Result<(), RenderError> {
        self.page
            .wait_for_navigation()
            .await
            .map(|_| ())
            .map_err(browser_error)
    }

    async fn has_element(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    async fn content(&self) -> Result<String, RenderError> {
        self.page.content().await.map_err(browser_error)
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.page.close().await.map_err(browser_error)
    }
}
