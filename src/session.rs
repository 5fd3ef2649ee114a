//! Drives the tax portal's purchase/sales register (RCV) page through one
//! ledger type for every month of a range.
//!
//! The portal is an Angular single-page app with unstable markup, so every
//! step tries several selectors in priority order and most waits are short
//! fixed polls. A failure in one month is dumped to the debug folder and the
//! session is steered back to the landing page before the next month.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    config::Account,
    interrupt::{is_interrupted, Interrupt},
    ledger::LedgerKind,
    period::{DateRange, YearMonth},
    webdriver::{Browser, Element, Locator, WdResult, ENTER},
    Result,
};

pub const PORTAL_URL: &str = "https://www4.sii.cl/consdcvinternetui/";

const LOGIN_URL_MARKERS: [&str; 3] = ["IngresoRutClave", "AUT2000", "AUTENTICACION"];

pub(crate) const SCROLL_INTO_VIEW: &str = "arguments[0].scrollIntoView({block:'center'});";
pub(crate) const SCRIPT_CLICK: &str = "arguments[0].click();";
pub(crate) const LOCATION_HASH: &str = "return window.location.hash || ''";
pub(crate) const ACTIVATE_TAB: &str = r#"
  var base = arguments[0];
  var a = document.querySelector("a[ui-sref='"+base+"']") || document.querySelector("a[href='#"+base+"/']");
  if(a){ a.click(); return true; }
  return false;
"#;

const YEAR_SELECT: &str = "//select[@ng-model='periodoAnho']";
const MONTH_SELECT: &str = "periodoMes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    PeriodSelected,
    TabActive,
    Downloaded,
}

/// Waits and retry counts used while driving the portal.
#[derive(Debug, Clone)]
pub struct Timings {
    pub element_wait: Duration,
    pub poll_interval: Duration,
    pub tab_wait: Duration,
    pub tab_poll: Duration,
    pub tab_polls: u32,
    pub download_poll: Duration,
    pub download_polls: u32,
    pub after_summary: Duration,
    pub after_detail: Duration,
    pub settle: Duration,
    pub retry_pause: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            element_wait: Duration::from_secs(14),
            poll_interval: Duration::from_millis(250),
            tab_wait: Duration::from_secs(6),
            tab_poll: Duration::from_millis(100),
            tab_polls: 12,
            download_poll: Duration::from_secs(1),
            download_polls: 10,
            after_summary: Duration::from_secs(1),
            after_detail: Duration::from_secs(2),
            settle: Duration::from_millis(200),
            retry_pause: Duration::from_millis(500),
        }
    }
}

impl Timings {
    /// No sleeping at all; every wait checks exactly once.
    pub fn instant() -> Self {
        Self {
            element_wait: Duration::ZERO,
            poll_interval: Duration::ZERO,
            tab_wait: Duration::ZERO,
            tab_poll: Duration::ZERO,
            download_poll: Duration::ZERO,
            after_summary: Duration::ZERO,
            after_detail: Duration::ZERO,
            settle: Duration::ZERO,
            retry_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    /// Months that completed, with the number of new files they produced.
    pub downloaded: Vec<(YearMonth, usize)>,
    pub failed: Vec<(YearMonth, String)>,
}

pub struct Extraction<'a, B: Browser> {
    browser: &'a mut B,
    account: &'a Account,
    kind: LedgerKind,
    download_dir: PathBuf,
    debug_dir: PathBuf,
    timings: Timings,
    interrupt: Interrupt,
    state: SessionState,
}

impl<'a, B: Browser> Extraction<'a, B> {
    pub fn new(
        browser: &'a mut B,
        account: &'a Account,
        kind: LedgerKind,
        download_dir: PathBuf,
        debug_dir: PathBuf,
    ) -> Self {
        Self {
            browser,
            account,
            kind,
            download_dir,
            debug_dir,
            timings: Timings::default(),
            interrupt: Interrupt::default(),
            state: SessionState::NotAuthenticated,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Extracts every month of `range`. Only an interrupt, or failing to reach
    /// the portal at all, ends the run early.
    pub fn run(&mut self, range: &DateRange) -> Result<ExtractionReport> {
        let mut report = ExtractionReport::default();
        self.open_portal().context("failed to open the RCV portal")?;
        self.dismiss_alerts();

        for period in range.months() {
            self.interrupt.check()?;
            let span = info_span!("period", %period);
            let _guard = span.enter();

            match self.extract_month(period) {
                Ok(files) => {
                    info!("{} {}: {} new file(s)", self.kind.tab_label(), period, files);
                    report.downloaded.push((period, files));
                }
                Err(e) if is_interrupted(&e) => return Err(e),
                Err(e) => {
                    error!("{} {}: {:#}", self.kind.tab_label(), period, e);
                    self.dump_debug(period);
                    if let Err(e) = self.open_portal() {
                        if is_interrupted(&e) {
                            return Err(e);
                        }
                        warn!("failed to return to the portal: {:#}", e);
                    }
                    report.failed.push((period, format!("{:#}", e)));
                }
            }
        }
        Ok(report)
    }

    fn extract_month(&mut self, period: YearMonth) -> Result<usize> {
        if self.on_login_page() {
            self.set_state(SessionState::NotAuthenticated);
            self.log_in()?;
            self.open_portal()?;
        }

        self.select_period(period)?;
        self.dismiss_alerts();

        self.activate_tab()?;
        self.dismiss_alerts();

        if !self.tab_active() {
            warn!("{} tab not active; retrying", self.kind.tab_label());
            self.activate_tab()?;
            self.pause(self.timings.retry_pause)?;
        }
        if !self.tab_active() {
            bail!("{} tab still not active after retry", self.kind.tab_label());
        }
        self.set_state(SessionState::TabActive);
        info!("tab active: {}", self.kind.tab_label());

        let before = snapshot(&self.download_dir);
        self.download_all()?;
        let mut new_files = self.wait_for_new_files(&before)?;
        if new_files == 0 {
            warn!(
                "no new files after {} polls; retrying download",
                self.timings.download_polls
            );
            self.download_all()?;
            new_files = snapshot(&self.download_dir).difference(&before).count();
        }
        self.set_state(SessionState::Downloaded);
        Ok(new_files)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn pause(&self, duration: Duration) -> Result<()> {
        self.interrupt.check()?;
        if !duration.is_zero() {
            thread::sleep(duration);
        }
        Ok(())
    }

    /// Polls `check` until it yields a value or `timeout` elapses. Protocol
    /// errors count as "not yet"; transport errors end the wait.
    fn wait_for<T>(
        &mut self,
        timeout: Duration,
        mut check: impl FnMut(&mut B) -> WdResult<Option<T>>,
    ) -> Result<Option<T>> {
        let started = Instant::now();
        loop {
            match check(&mut *self.browser) {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) if e.is_transport() => return Err(e.into()),
                Err(e) => debug!("check failed: {}", e),
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            self.pause(self.timings.poll_interval)?;
        }
    }

    fn wait_present(&mut self, locator: &Locator, timeout: Duration) -> Result<Option<Element>> {
        self.wait_for(timeout, |b| b.find(locator))
    }

    fn wait_any(&mut self, locators: &[Locator], timeout: Duration) -> Result<Option<Element>> {
        self.wait_for(timeout, |b| {
            for locator in locators {
                if let Some(found) = b.find(locator)? {
                    return Ok(Some(found));
                }
            }
            Ok(None)
        })
    }

    fn wait_clickable(&mut self, locator: &Locator, timeout: Duration) -> Result<Option<Element>> {
        self.wait_for(timeout, |b| {
            for element in b.find_all(locator)? {
                if b.is_displayed(&element)? && b.is_enabled(&element)? {
                    return Ok(Some(element));
                }
            }
            Ok(None)
        })
    }

    fn script_click(&mut self, element: &Element) -> WdResult<()> {
        self.browser
            .execute(SCRIPT_CLICK, vec![element.to_json()])
            .map(|_| ())
    }

    fn scroll_into_view(&mut self, element: &Element) {
        if let Err(e) = self
            .browser
            .execute(SCROLL_INTO_VIEW, vec![element.to_json()])
        {
            debug!("scroll failed: {}", e);
        }
    }

    /// Clicks the first clickable match of `locator`: natively, then through
    /// a script, then by sending Enter. `false` when nothing became clickable
    /// or every attempt was refused.
    fn resilient_click(&mut self, locator: &Locator, timeout: Duration) -> Result<bool> {
        let Some(element) = self.wait_clickable(locator, timeout)? else {
            return Ok(false);
        };
        self.scroll_into_view(&element);
        match self.browser.click(&element) {
            Ok(()) => return Ok(true),
            Err(e) => debug!("native click on {} refused: {}", locator, e),
        }
        match self.script_click(&element) {
            Ok(()) => return Ok(true),
            Err(e) => debug!("script click on {} refused: {}", locator, e),
        }
        Ok(self.browser.send_keys(&element, ENTER).is_ok())
    }

    /// Clicks visible "Aceptar"/"OK"/"Cerrar" buttons of any open modal.
    fn dismiss_alerts(&mut self) {
        let buttons = [
            "//div[contains(@class,'modal') and contains(@class,'show')]//button[normalize-space()='Aceptar']",
            "//div[contains(@class,'modal') and contains(@class,'show')]//button[normalize-space()='OK']",
            "//div[contains(@class,'modal') and contains(@class,'show')]//button[contains(.,'Cerrar')]",
            "//button[normalize-space()='Aceptar']",
            "//button[normalize-space()='OK']",
            "//button[contains(.,'Cerrar')]",
        ];
        for xpath in buttons {
            let Ok(found) = self.browser.find_all(&Locator::xpath(xpath)) else {
                continue;
            };
            for element in found {
                let visible = self.browser.is_displayed(&element).unwrap_or(false)
                    && self.browser.is_enabled(&element).unwrap_or(false);
                if visible && self.script_click(&element).is_ok() {
                    debug!("dismissed alert via {}", xpath);
                    let _ = self.pause(self.timings.settle);
                }
            }
        }
    }

    fn on_login_page(&mut self) -> bool {
        if let Ok(url) = self.browser.current_url() {
            if LOGIN_URL_MARKERS.iter().any(|m| url.contains(m)) {
                return true;
            }
        }
        let fields = [
            Locator::id("rutcntr"),
            Locator::name("rut"),
            Locator::id("clave"),
            Locator::name("clave"),
            Locator::id("bt_ingresar"),
        ];
        fields
            .iter()
            .any(|f| matches!(self.browser.find(f), Ok(Some(_))))
    }

    fn fill(&mut self, element: &Element, text: &str) -> WdResult<()> {
        self.browser.clear(element)?;
        self.browser.send_keys(element, text)
    }

    /// Login form with `id` attributes (`rutcntr`, `clave`, `bt_ingresar`).
    fn submit_primary_login(&mut self) -> Result<bool> {
        let Some(id_field) = self.wait_present(&Locator::id("rutcntr"), self.timings.element_wait)?
        else {
            return Ok(false);
        };
        let account = self.account;
        self.fill(&id_field, &account.taxpayer_id)?;
        let secret_field = self
            .browser
            .find(&Locator::id("clave"))?
            .context("secret field missing")?;
        self.fill(&secret_field, &account.secret)?;
        let button = self
            .browser
            .find(&Locator::id("bt_ingresar"))?
            .context("login button missing")?;
        self.script_click(&button)?;
        self.pause(self.timings.settle)?;
        Ok(true)
    }

    /// Login form with `name` attributes and a generic submit button.
    fn submit_secondary_login(&mut self) -> Result<bool> {
        let Some(id_field) = self.wait_present(&Locator::name("rut"), self.timings.element_wait)?
        else {
            return Ok(false);
        };
        let account = self.account;
        self.fill(&id_field, &account.taxpayer_id)?;
        let secret_field = self
            .browser
            .find(&Locator::name("clave"))?
            .context("secret field missing")?;
        self.fill(&secret_field, &account.secret)?;
        let submit = [
            "//button[@id='bt_ingresar']",
            "//button[contains(.,'Ingresar')]",
            "//input[@type='submit']",
        ];
        for xpath in submit {
            if let Ok(Some(button)) = self.browser.find(&Locator::xpath(xpath)) {
                if self.script_click(&button).is_ok() {
                    self.pause(self.timings.settle)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn log_in(&mut self) -> Result<()> {
        if !self.on_login_page() {
            return Ok(());
        }
        match self.submit_primary_login() {
            Ok(true) => return Ok(()),
            Ok(false) => debug!("primary login form not found"),
            Err(e) if is_interrupted(&e) => return Err(e),
            Err(e) => debug!("primary login form failed: {:#}", e),
        }
        match self.submit_secondary_login() {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("no known login form could be submitted");
                Ok(())
            }
            Err(e) if is_interrupted(&e) => Err(e),
            Err(e) => {
                warn!("secondary login form failed: {:#}", e);
                Ok(())
            }
        }
    }

    /// Loads the portal landing page, logging in when redirected.
    fn open_portal(&mut self) -> Result<()> {
        self.browser.navigate(PORTAL_URL)?;
        let landing = [
            Locator::id(MONTH_SELECT),
            Locator::xpath(YEAR_SELECT),
            Locator::id("rutcntr"),
        ];
        self.wait_any(&landing, self.timings.element_wait)?;
        self.log_in()?;
        let selectors = [Locator::id(MONTH_SELECT), Locator::xpath(YEAR_SELECT)];
        if self
            .wait_any(&selectors, self.timings.element_wait)?
            .is_some()
        {
            self.set_state(SessionState::Authenticated);
        } else {
            self.pause(self.timings.settle)?;
        }
        Ok(())
    }

    fn select_option(&mut self, select: &Element, value: &str) -> Result<()> {
        let option = self
            .browser
            .find_within(select, &Locator::css(format!("option[value='{}']", value)))?
            .with_context(|| format!("option {:?} not available", value))?;
        self.browser.click(&option)?;
        Ok(())
    }

    fn select_period(&mut self, period: YearMonth) -> Result<()> {
        let month = self
            .wait_present(&Locator::id(MONTH_SELECT), self.timings.element_wait)?
            .context("month selector not found")?;
        self.select_option(&month, &format!("{:02}", period.month()))?;
        let year = self
            .wait_present(&Locator::xpath(YEAR_SELECT), self.timings.element_wait)?
            .context("year selector not found")?;
        self.select_option(&year, &period.year().to_string())?;

        let consult = [
            Locator::xpath("/html/body/div[1]/div[2]/div[1]/div[1]/div/div[1]/div/div[3]/div/form/div[3]/button"),
            Locator::xpath("//button[@type='submit' and normalize-space()='Consultar']"),
            Locator::css("form button.btn.btn-default.btn-xs-block.btn-block[type='submit']"),
        ];
        let mut clicked = false;
        for locator in &consult {
            if self.resilient_click(locator, self.timings.element_wait)? {
                clicked = true;
                break;
            }
        }
        if !clicked {
            bail!("could not click 'Consultar'");
        }

        let results = [
            Locator::xpath("//*[@role='tablist']"),
            Locator::xpath("//*[contains(@class,'nav-tabs')]"),
            Locator::xpath("//strong[normalize-space()='COMPRA']"),
            Locator::xpath("//strong[normalize-space()='VENTA']"),
        ];
        self.wait_any(&results, self.timings.element_wait)?;
        self.set_state(SessionState::PeriodSelected);
        Ok(())
    }

    /// Whether the tab for this ledger is showing: its label sits in an
    /// active `li`, the URL hash names it, or its panel carries `.active`.
    fn tab_active(&mut self) -> bool {
        let label = self.kind.tab_label();
        let route = self.kind.route();

        let strong = Locator::xpath(format!("//ul//li//strong[normalize-space()='{}']", label));
        if let Ok(Some(strong)) = self.browser.find(&strong) {
            if self.browser.is_displayed(&strong).unwrap_or(false) {
                if let Ok(Some(li)) = self.browser.find_within(&strong, &Locator::xpath("../../..")) {
                    let class = self.browser.attribute(&li, "class").ok().flatten();
                    if class.is_some_and(|c| c.contains("active")) {
                        return true;
                    }
                }
            }
        }

        if let Ok(Value::String(hash)) = self.browser.execute(LOCATION_HASH, Vec::new()) {
            if hash.contains(&format!("#{}/", route)) {
                return true;
            }
        }

        let panels = [
            format!("#{}.active", route),
            format!("#pane-{}.active", route),
            format!("[role='tabpanel'].active[id*='{}']", route),
        ];
        panels
            .into_iter()
            .any(|css| matches!(self.browser.find(&Locator::Css(css)), Ok(Some(_))))
    }

    fn poll_tab_active(&mut self) -> Result<bool> {
        for _ in 0..self.timings.tab_polls {
            if self.tab_active() {
                return Ok(true);
            }
            self.pause(self.timings.tab_poll)?;
        }
        Ok(false)
    }

    fn activate_tab(&mut self) -> Result<()> {
        if self.tab_active() {
            return Ok(());
        }
        let route = self.kind.route();

        let anchors = [
            Locator::css(format!("a[ui-sref='{}']", route)),
            Locator::css(format!("a[href='#{}/']", route)),
            Locator::xpath(format!("//ul/li/a[@ui-sref='{}']", route)),
            Locator::xpath(format!("//ul/li/a[@href='#{}/']", route)),
        ];
        for locator in &anchors {
            let Some(anchor) = self.wait_clickable(locator, self.timings.tab_wait)? else {
                continue;
            };
            self.scroll_into_view(&anchor);
            if let Err(e) = self.script_click(&anchor) {
                debug!("click on {} failed: {}", locator, e);
                continue;
            }
            if self.poll_tab_active()? {
                return Ok(());
            }
        }

        let absolute = match self.kind {
            LedgerKind::Purchases => {
                "/html/body/div[1]/div[2]/div[1]/div[1]/div/div[2]/ul/li[1]/a/strong"
            }
            LedgerKind::Sales => "/html/body/div[1]/div[2]/div[1]/div[1]/div/div[2]/ul/li[2]/a/strong",
        };
        if let Some(strong) = self.wait_present(&Locator::xpath(absolute), self.timings.tab_wait)? {
            if let Ok(Some(anchor)) = self
                .browser
                .find_within(&strong, &Locator::xpath("./parent::*"))
            {
                self.scroll_into_view(&anchor);
                if self.script_click(&anchor).is_ok() && self.poll_tab_active()? {
                    return Ok(());
                }
            }
        }

        let clicked = self
            .browser
            .execute(ACTIVATE_TAB, vec![Value::from(route)])
            .map(|v| v.as_bool() == Some(true))
            .unwrap_or(false);
        if clicked && self.poll_tab_active()? {
            return Ok(());
        }

        bail!("could not activate the {} tab", self.kind.tab_label())
    }

    /// Clicks "Descargar Resumenes" then "Descargar Detalles". A button that
    /// never shows up is not an error.
    fn download_all(&mut self) -> Result<()> {
        let markers = [
            Locator::xpath("//button[contains(.,'Descargar Resumenes')]"),
            Locator::xpath("//button[contains(.,'Descargar Detalles')]"),
            Locator::xpath("/html/body/div[1]/div[2]/div[1]/div[2]/div/div/div/div/div[4]"),
        ];
        self.wait_any(&markers, self.timings.element_wait)?;

        let summaries = [
            Locator::xpath("/html/body/div[1]/div[2]/div[1]/div[2]/div/div/div/div/div[4]/div[1]/div[1]/button"),
            Locator::xpath("//button[normalize-space()='Descargar Resumenes']"),
            Locator::xpath("//button[contains(.,'Descargar Resumenes')]"),
        ];
        self.click_first(&summaries, self.timings.after_summary)?;

        let details = [
            Locator::xpath("/html/body/div[1]/div[2]/div[1]/div[2]/div/div/div/div/div[4]/div[1]/div[2]/button"),
            Locator::xpath("//button[normalize-space()='Descargar Detalles']"),
            Locator::xpath("//button[contains(.,'Descargar Detalles')]"),
        ];
        self.click_first(&details, self.timings.after_detail)?;
        Ok(())
    }

    fn click_first(&mut self, locators: &[Locator], settle: Duration) -> Result<bool> {
        for locator in locators {
            match self.resilient_click(locator, self.timings.element_wait) {
                Ok(true) => {
                    self.pause(settle)?;
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if is_interrupted(&e) => return Err(e),
                Err(e) => debug!("click on {} failed: {:#}", locator, e),
            }
        }
        debug!("no button matched {:?}", locators.first());
        Ok(false)
    }

    fn wait_for_new_files(&mut self, before: &BTreeSet<String>) -> Result<usize> {
        for _ in 0..self.timings.download_polls {
            let new = snapshot(&self.download_dir).difference(before).count();
            if new > 0 {
                return Ok(new);
            }
            self.pause(self.timings.download_poll)?;
        }
        Ok(0)
    }

    /// Saves the page markup and a screenshot for a failed month.
    fn dump_debug(&mut self, period: YearMonth) {
        if let Err(e) = fs::create_dir_all(&self.debug_dir) {
            warn!("failed to create {}: {}", self.debug_dir.display(), e);
            return;
        }
        let stem = format!("debug_{}_{}", self.kind.tab_label(), period);
        match self.browser.page_source() {
            Ok(html) => {
                let path = self.debug_dir.join(format!("{}.html", stem));
                if let Err(e) = fs::write(&path, html) {
                    warn!("failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => debug!("page source unavailable: {}", e),
        }
        match self.browser.screenshot() {
            Ok(png) => {
                let path = self.debug_dir.join(format!("{}.png", stem));
                if let Err(e) = fs::write(&path, png) {
                    warn!("failed to write {}: {}", path.display(), e);
                }
            }
            Err(e) => debug!("screenshot unavailable: {}", e),
        }
    }
}

/// Names of the entries currently in `dir`; empty if it cannot be read.
fn snapshot(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests;
