use std::ffi::OsStr;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use common::{error::AppError, utils::config::AppConfig};

use crate::driver::{Artifact, ArtifactStream, DriverError, PortalCredentials, RetrievalDriver};

const DEFAULT_TAB_TIMEOUT: Duration = Duration::from_secs(20);
const SIGN_IN_SETTLE: Duration = Duration::from_secs(15);
const PAGE_RENDER_SETTLE_MS: u64 = 750;

// The portal markup shifts between releases; each selector carries fallbacks.
const USERNAME_SELECTOR: &str = "input#email, input[name='userID'], input[type='email']";
const PASSWORD_SELECTOR: &str = "input#pwd, input[type='password']";
const STATEMENT_TABLE_SELECTOR: &str = "#invoice-table, table.statements";

/// Headless-Chrome implementation of the retrieval contract: signs in, walks
/// the statement table page by page, then downloads each harvested link over
/// the exported session.
pub struct PortalDriver {
    portal_url: Url,
    proxy: Option<String>,
    http: reqwest::Client,
}

impl PortalDriver {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let portal_url = Url::parse(&config.portal_url)
            .map_err(|err| AppError::Validation(format!("invalid portal_url: {err}")))?;

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(proxy) = config.portal_proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| AppError::Validation(format!("invalid portal_proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|err| AppError::InternalError(format!("http client: {err}")))?;

        Ok(Self {
            portal_url,
            proxy: config.portal_proxy.clone(),
            http,
        })
    }
}

#[async_trait]
impl RetrievalDriver for PortalDriver {
    async fn fetch(
        &self,
        credentials: &PortalCredentials,
        max_pages: u32,
    ) -> Result<ArtifactStream, DriverError> {
        let portal = self.portal_url.clone();
        let creds = credentials.clone();
        let proxy = self.proxy.clone();

        let session = tokio::task::spawn_blocking(move || {
            discover_statements(&portal, &creds, max_pages, proxy.as_deref())
        })
        .await
        .map_err(|err| DriverError::Browser(format!("scrape task failed: {err}")))??;

        info!(
            statements = session.statements.len(),
            "portal discovery finished"
        );

        Ok(artifact_stream(self.http.clone(), session))
    }
}

struct StatementRef {
    file_name: String,
    url: String,
}

struct PortalSession {
    cookie_header: String,
    statements: Vec<StatementRef>,
}

fn artifact_stream(client: reqwest::Client, session: PortalSession) -> ArtifactStream {
    let PortalSession {
        cookie_header,
        statements,
    } = session;

    Box::pin(try_stream! {
        for (index, statement) in statements.into_iter().enumerate() {
            let artifact = download_statement(&client, &cookie_header, &statement)
                .await
                .map_err(|message| DriverError::PartialFailure {
                    downloaded: index,
                    message,
                })?;
            yield artifact;
        }
    })
}

async fn download_statement(
    client: &reqwest::Client,
    cookie_header: &str,
    statement: &StatementRef,
) -> Result<Artifact, String> {
    debug!(url = %statement.url, "downloading statement");
    let response = client
        .get(&statement.url)
        .header(reqwest::header::COOKIE, cookie_header)
        .send()
        .await
        .map_err(|err| format!("request for {} failed: {err}", statement.url))?
        .error_for_status()
        .map_err(|err| format!("download of {} rejected: {err}", statement.url))?;

    let bytes = response
        .bytes()
        .await
        .map_err(|err| format!("body of {} truncated: {err}", statement.url))?;

    Ok(Artifact {
        file_name: statement.file_name.clone(),
        bytes,
    })
}

/// Blocking browser session: sign in, harvest download links across paginated
/// statement tables, export the cookies for the download client.
fn discover_statements(
    portal: &Url,
    credentials: &PortalCredentials,
    max_pages: u32,
    proxy: Option<&str>,
) -> Result<PortalSession, DriverError> {
    let browser = launch_browser(proxy)?;
    let tab = browser
        .new_tab()
        .map_err(|err| DriverError::Browser(format!("failed to open tab: {err}")))?;
    tab.set_default_timeout(DEFAULT_TAB_TIMEOUT);

    tab.navigate_to(portal.as_str())
        .map_err(|err| DriverError::Browser(format!("navigation failed: {err}")))?
        .wait_until_navigated()
        .map_err(|err| DriverError::Timeout(format!("portal never loaded: {err}")))?;

    sign_in(&tab, credentials)?;

    let mut statements = Vec::new();
    let mut visited = 0u32;
    while visited < max_pages {
        statements.extend(harvest_page(&tab, portal)?);
        visited += 1;
        if visited >= max_pages {
            // ceiling reached: a truncated result is still a successful one
            info!(visited, "page ceiling reached, truncating pagination walk");
            break;
        }
        if !advance_page(&tab)? {
            break;
        }
    }

    let cookie_header = cookie_header(&tab)?;
    Ok(PortalSession {
        cookie_header,
        statements,
    })
}

fn launch_browser(proxy: Option<&str>) -> Result<Browser, DriverError> {
    let proxy_arg = proxy.map(|p| format!("--proxy-server={p}"));

    let mut builder = headless_chrome::LaunchOptionsBuilder::default();
    builder.sandbox(false);
    if let Some(arg) = proxy_arg.as_deref() {
        builder.args(vec![OsStr::new(arg)]);
    }
    let options = builder
        .build()
        .map_err(|err| DriverError::Browser(format!("failed to configure Chrome: {err}")))?;

    Browser::new(options).map_err(|err| DriverError::Browser(format!("failed to start Chrome: {err}")))
}

fn sign_in(tab: &Tab, credentials: &PortalCredentials) -> Result<(), DriverError> {
    tab.wait_for_element(USERNAME_SELECTOR)
        .map_err(|err| DriverError::Timeout(format!("sign-in form never appeared: {err}")))?
        .type_into(&credentials.username)
        .map_err(|err| DriverError::Browser(format!("failed to enter username: {err}")))?;
    tab.press_key("Enter")
        .map_err(|err| DriverError::Browser(format!("failed to submit username: {err}")))?;

    tab.wait_for_element(PASSWORD_SELECTOR)
        .map_err(|err| DriverError::Timeout(format!("password prompt never appeared: {err}")))?
        .type_into(&credentials.password)
        .map_err(|err| DriverError::Browser(format!("failed to enter password: {err}")))?;
    tab.press_key("Enter")
        .map_err(|err| DriverError::Browser(format!("failed to submit password: {err}")))?;

    // Either the statement table renders or the portal pushes back a banner.
    if tab
        .wait_for_element_with_custom_timeout(STATEMENT_TABLE_SELECTOR, SIGN_IN_SETTLE)
        .is_err()
    {
        return Err(match sign_in_error_banner(tab) {
            Some(message) => DriverError::AuthFailure(message),
            None => DriverError::Timeout("statement table never appeared after sign-in".into()),
        });
    }

    Ok(())
}

fn sign_in_error_banner(tab: &Tab) -> Option<String> {
    const SCRIPT: &str = r#"(function() {
        const banner = document.querySelector('.ups-error, .alert-danger, [role="alert"]');
        return banner ? banner.textContent.trim() : null;
    })()"#;

    tab.evaluate(SCRIPT, false)
        .ok()
        .and_then(|result| result.value)
        .and_then(|value| value.as_str().map(str::to_owned))
        .filter(|message| !message.is_empty())
}

fn harvest_page(tab: &Tab, portal: &Url) -> Result<Vec<StatementRef>, DriverError> {
    const SCRIPT: &str = r#"(function() {
        const anchors = document.querySelectorAll(
            '#invoice-table a[href], table.statements a[href]'
        );
        const rows = [];
        anchors.forEach((a) => {
            const href = a.getAttribute('href');
            if (!href) return;
            rows.push({
                name: (a.getAttribute('download') || a.textContent || '').trim(),
                href,
            });
        });
        return JSON.stringify(rows);
    })()"#;

    let result = tab
        .evaluate(SCRIPT, false)
        .map_err(|err| DriverError::Browser(format!("failed to harvest statement links: {err}")))?;

    let raw = result
        .value
        .as_ref()
        .and_then(Value::as_str)
        .unwrap_or("[]")
        .to_string();
    let rows: Vec<HarvestedRow> = serde_json::from_str(&raw)
        .map_err(|err| DriverError::Browser(format!("unexpected harvest payload: {err}")))?;

    let mut statements = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let Some(url) = resolve_statement_url(portal, &row.href) else {
            warn!(href = %row.href, "skipping statement link that does not resolve");
            continue;
        };
        statements.push(StatementRef {
            file_name: statement_file_name(&row.name, &row.href, index),
            url: url.into(),
        });
    }

    debug!(harvested = statements.len(), "harvested statement page");
    Ok(statements)
}

fn advance_page(tab: &Tab) -> Result<bool, DriverError> {
    const SCRIPT: &str = r#"(function() {
        const next = document.querySelector(
            'a.paginate_button.next:not(.disabled), button.pagination-next:not([disabled])'
        );
        if (!next) return false;
        next.click();
        return true;
    })()"#;

    let result = tab
        .evaluate(SCRIPT, false)
        .map_err(|err| DriverError::Browser(format!("failed to advance pagination: {err}")))?;

    let advanced = result
        .value
        .as_ref()
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if advanced {
        // let the table re-render before the next harvest
        std::thread::sleep(Duration::from_millis(PAGE_RENDER_SETTLE_MS));
    }

    Ok(advanced)
}

fn cookie_header(tab: &Tab) -> Result<String, DriverError> {
    let cookies = tab
        .get_cookies()
        .map_err(|err| DriverError::Browser(format!("failed to export session cookies: {err}")))?;

    Ok(cookies
        .into_iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; "))
}

#[derive(serde::Deserialize)]
struct HarvestedRow {
    name: String,
    href: String,
}

fn resolve_statement_url(portal: &Url, href: &str) -> Option<Url> {
    portal.join(href).ok()
}

fn statement_file_name(name: &str, href: &str, index: usize) -> String {
    if !name.is_empty() {
        return name.to_string();
    }

    href.split('?')
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("statement-{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal() -> Url {
        Url::parse("https://billing.example.com/app/statements").expect("url")
    }

    #[test]
    fn resolves_relative_and_absolute_links() {
        let portal = portal();

        let relative = resolve_statement_url(&portal, "/download/inv-1.csv").expect("relative");
        assert_eq!(
            relative.as_str(),
            "https://billing.example.com/download/inv-1.csv"
        );

        let absolute =
            resolve_statement_url(&portal, "https://cdn.example.com/inv-2.csv").expect("absolute");
        assert_eq!(absolute.as_str(), "https://cdn.example.com/inv-2.csv");
    }

    #[test]
    fn file_name_prefers_the_portal_label() {
        assert_eq!(
            statement_file_name("invoice-march.csv", "/download/abc", 0),
            "invoice-march.csv"
        );
    }

    #[test]
    fn file_name_falls_back_to_the_href_segment() {
        assert_eq!(
            statement_file_name("", "/download/inv-9.csv?session=1", 3),
            "inv-9.csv"
        );
    }

    #[test]
    fn file_name_falls_back_to_the_sequence() {
        assert_eq!(statement_file_name("", "", 3), "statement-3");
    }
}
