use std::collections::HashMap;

use serde_json::Value;
use tempfile::TempDir;

use super::*;
use crate::webdriver::{WebDriverError, ELEMENT_KEY};

const LOGIN_URL: &str = "https://zeusr.sii.cl/AUT2000/InicioAutenticacion/IngresoRutClave.html";
const CONSULT: &str = "//button[@type='submit' and normalize-space()='Consultar']";
const SUMMARY_BUTTON: &str = "//button[normalize-space()='Descargar Resumenes']";
const DETAIL_BUTTON: &str = "//button[normalize-space()='Descargar Detalles']";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginLayout {
    Ids,
    Names,
}

/// In-memory stand-in for the portal: a login form, the period selectors,
/// two tabs and two download buttons that drop files into a folder.
struct FakePortal {
    taxpayer_id: String,
    secret: String,
    layout: LoginLayout,
    logged_in: bool,
    url: String,
    typed: HashMap<String, String>,
    month: Option<String>,
    year: Option<String>,
    consulted: bool,
    active_tab: Option<String>,
    tab_stuck: bool,
    swallow_downloads: usize,
    logout_after_first_month: bool,
    download_dir: PathBuf,
    logins: usize,
}

impl FakePortal {
    fn new(download_dir: &Path) -> Self {
        Self {
            taxpayer_id: "76123456-7".to_string(),
            secret: "hunter2".to_string(),
            layout: LoginLayout::Ids,
            logged_in: false,
            url: String::new(),
            typed: HashMap::new(),
            month: None,
            year: None,
            consulted: false,
            active_tab: None,
            tab_stuck: false,
            swallow_downloads: 0,
            logout_after_first_month: false,
            download_dir: download_dir.to_path_buf(),
            logins: 0,
        }
    }

    fn lookup(&self, locator: &Locator) -> Option<String> {
        if !self.logged_in {
            let id = match (self.layout, locator) {
                (LoginLayout::Ids, Locator::Id(id)) if id == "rutcntr" => "login:id",
                (LoginLayout::Ids, Locator::Id(id)) if id == "clave" => "login:secret",
                (LoginLayout::Ids, Locator::Id(id)) if id == "bt_ingresar" => "login:submit",
                (LoginLayout::Names, Locator::Name(n)) if n == "rut" => "login:id",
                (LoginLayout::Names, Locator::Name(n)) if n == "clave" => "login:secret",
                (LoginLayout::Names, Locator::XPath(x)) if x == "//button[contains(.,'Ingresar')]" => {
                    "login:submit"
                }
                _ => return None,
            };
            return Some(id.to_string());
        }

        match locator {
            Locator::Id(id) if id == MONTH_SELECT => Some("select:month".to_string()),
            Locator::XPath(x) if x == YEAR_SELECT => Some("select:year".to_string()),
            Locator::XPath(x) if x == CONSULT => Some("consult".to_string()),
            Locator::XPath(x) if self.consulted && x == "//*[@role='tablist']" => {
                Some("tablist".to_string())
            }
            Locator::Css(c) if self.consulted && c.starts_with("a[ui-sref='") => {
                let route = c.trim_start_matches("a[ui-sref='").trim_end_matches("']");
                Some(format!("tab:{}", route))
            }
            Locator::Css(c) if c.ends_with(".active") && c.starts_with('#') => {
                let route = c.trim_start_matches('#').trim_end_matches(".active");
                (self.active_tab.as_deref() == Some(route)).then(|| format!("panel:{}", route))
            }
            Locator::XPath(x) if self.active_tab.is_some() && x == SUMMARY_BUTTON => {
                Some("download:summary".to_string())
            }
            Locator::XPath(x) if self.active_tab.is_some() && x == DETAIL_BUTTON => {
                Some("download:detail".to_string())
            }
            _ => None,
        }
    }

    fn write_download(&mut self, part: &str) {
        if self.swallow_downloads > 0 {
            self.swallow_downloads -= 1;
            return;
        }
        let name = format!(
            "RCV_{}_{}{}_{}.csv",
            self.active_tab.as_deref().unwrap_or("none"),
            self.year.as_deref().unwrap_or("????"),
            self.month.as_deref().unwrap_or("??"),
            part
        );
        fs::write(self.download_dir.join(name), "Nro;Tipo Doc\n1;33\n").unwrap();
    }

    fn activate(&mut self, id: &str) {
        if let Some(month) = id.strip_prefix("option:month:") {
            self.month = Some(month.to_string());
        } else if let Some(year) = id.strip_prefix("option:year:") {
            self.year = Some(year.to_string());
        } else if let Some(route) = id.strip_prefix("tab:") {
            if !self.tab_stuck {
                self.active_tab = Some(route.to_string());
            }
        } else {
            match id {
                "login:submit" => {
                    let ok = self.typed.get("login:id") == Some(&self.taxpayer_id)
                        && self.typed.get("login:secret") == Some(&self.secret);
                    if ok {
                        self.logged_in = true;
                        self.logins += 1;
                        self.url = PORTAL_URL.to_string();
                    }
                }
                "consult" if self.month.is_some() && self.year.is_some() => {
                    self.consulted = true;
                    self.active_tab = Some("compra".to_string());
                }
                "download:summary" => self.write_download("resumen"),
                "download:detail" => {
                    self.write_download("detalle");
                    if self.logout_after_first_month {
                        self.logout_after_first_month = false;
                        self.logged_in = false;
                        self.url = LOGIN_URL.to_string();
                    }
                }
                _ => {}
            }
        }
    }
}

impl Browser for FakePortal {
    fn navigate(&mut self, url: &str) -> WdResult<()> {
        self.consulted = false;
        self.active_tab = None;
        self.month = None;
        self.year = None;
        self.url = if self.logged_in {
            url.to_string()
        } else {
            LOGIN_URL.to_string()
        };
        Ok(())
    }

    fn current_url(&mut self) -> WdResult<String> {
        Ok(self.url.clone())
    }

    fn find_all(&mut self, locator: &Locator) -> WdResult<Vec<Element>> {
        Ok(self.lookup(locator).map(Element::new).into_iter().collect())
    }

    fn find_all_within(&mut self, parent: &Element, locator: &Locator) -> WdResult<Vec<Element>> {
        let found = match (parent.id(), locator) {
            ("select:month", Locator::Css(c)) | ("select:year", Locator::Css(c)) => {
                let value = c.trim_start_matches("option[value='").trim_end_matches("']");
                let which = parent.id().trim_start_matches("select:");
                Some(Element::new(format!("option:{}:{}", which, value)))
            }
            _ => None,
        };
        Ok(found.into_iter().collect())
    }

    fn click(&mut self, element: &Element) -> WdResult<()> {
        self.activate(element.id());
        Ok(())
    }

    fn clear(&mut self, element: &Element) -> WdResult<()> {
        self.typed.remove(element.id());
        Ok(())
    }

    fn send_keys(&mut self, element: &Element, text: &str) -> WdResult<()> {
        self.typed
            .entry(element.id().to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    fn is_displayed(&mut self, _element: &Element) -> WdResult<bool> {
        Ok(true)
    }

    fn is_enabled(&mut self, _element: &Element) -> WdResult<bool> {
        Ok(true)
    }

    fn attribute(&mut self, _element: &Element, _name: &str) -> WdResult<Option<String>> {
        Ok(None)
    }

    fn execute(&mut self, script: &str, args: Vec<Value>) -> WdResult<Value> {
        if script == SCROLL_INTO_VIEW {
            Ok(Value::Null)
        } else if script == SCRIPT_CLICK {
            let id = args
                .first()
                .and_then(|a| a.get(ELEMENT_KEY))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.activate(&id);
            Ok(Value::Null)
        } else if script == LOCATION_HASH {
            Ok(Value::from(
                self.active_tab
                    .as_ref()
                    .map(|t| format!("#{}/resumen", t))
                    .unwrap_or_default(),
            ))
        } else if script == ACTIVATE_TAB {
            Ok(Value::Bool(false))
        } else {
            Err(WebDriverError::protocol("javascript error", "unknown script"))
        }
    }

    fn page_source(&mut self) -> WdResult<String> {
        Ok("<html><body>portal</body></html>".to_string())
    }

    fn screenshot(&mut self) -> WdResult<Vec<u8>> {
        Ok(b"\x89PNG".to_vec())
    }
}

struct Fixture {
    _dir: TempDir,
    downloads: PathBuf,
    debug: PathBuf,
    account: Account,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let downloads = dir.path().join("RCV_Venta");
    fs::create_dir_all(&downloads).unwrap();
    let debug = dir.path().join("debug");
    Fixture {
        downloads,
        debug,
        _dir: dir,
        account: Account {
            taxpayer_id: "76123456-7".to_string(),
            secret: "hunter2".to_string(),
        },
    }
}

fn extract(
    portal: &mut FakePortal,
    fx: &Fixture,
    kind: LedgerKind,
    range: &DateRange,
) -> (Result<ExtractionReport>, SessionState) {
    let mut extraction = Extraction::new(
        portal,
        &fx.account,
        kind,
        fx.downloads.clone(),
        fx.debug.clone(),
    )
    .with_timings(Timings::instant());
    let report = extraction.run(range);
    (report, extraction.state())
}

fn file_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn downloads_every_month_of_the_range() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    let range = DateRange::new(2023, 12, 2024, 2).unwrap();

    let (report, state) = extract(&mut portal, &fx, LedgerKind::Sales, &range);
    let report = report.unwrap();

    assert!(report.failed.is_empty());
    let months: Vec<String> = report.downloaded.iter().map(|(m, _)| m.to_string()).collect();
    assert_eq!(months, ["2023-12", "2024-01", "2024-02"]);
    assert!(report.downloaded.iter().all(|(_, n)| *n == 2));
    assert_eq!(file_count(&fx.downloads), 6);
    assert!(fx.downloads.join("RCV_venta_202401_detalle.csv").exists());
    assert_eq!(state, SessionState::Downloaded);
    assert_eq!(portal.logins, 1);
}

#[test]
fn already_active_tab_is_used_as_is() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    let range = DateRange::new(2024, 3, 2024, 3).unwrap();

    let (report, _) = extract(&mut portal, &fx, LedgerKind::Purchases, &range);
    let report = report.unwrap();

    assert_eq!(report.downloaded.len(), 1);
    assert!(fx.downloads.join("RCV_compra_202403_resumen.csv").exists());
}

#[test]
fn falls_back_to_name_based_login_form() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    portal.layout = LoginLayout::Names;
    let range = DateRange::new(2024, 1, 2024, 1).unwrap();

    let (report, _) = extract(&mut portal, &fx, LedgerKind::Sales, &range);

    assert_eq!(report.unwrap().downloaded.len(), 1);
    assert_eq!(portal.logins, 1);
}

#[test]
fn logs_in_again_when_session_expires() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    portal.logout_after_first_month = true;
    let range = DateRange::new(2024, 1, 2024, 2).unwrap();

    let (report, _) = extract(&mut portal, &fx, LedgerKind::Sales, &range);
    let report = report.unwrap();

    assert_eq!(report.downloaded.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(portal.logins, 2);
}

#[test]
fn retries_download_when_nothing_arrives() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    portal.swallow_downloads = 2;
    let range = DateRange::new(2024, 5, 2024, 5).unwrap();

    let (report, _) = extract(&mut portal, &fx, LedgerKind::Sales, &range);
    let report = report.unwrap();

    assert_eq!(report.downloaded, vec![(YearMonth::new(2024, 5).unwrap(), 2)]);
    assert_eq!(portal.swallow_downloads, 0);
}

#[test]
fn stuck_tab_fails_month_but_not_range() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    portal.tab_stuck = true;
    let range = DateRange::new(2024, 1, 2024, 2).unwrap();

    let (report, state) = extract(&mut portal, &fx, LedgerKind::Sales, &range);
    let report = report.unwrap();

    assert!(report.downloaded.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert!(report.failed[0].1.contains("VENTA"));
    assert!(fx.debug.join("debug_VENTA_2024-01.html").exists());
    assert!(fx.debug.join("debug_VENTA_2024-02.png").exists());
    assert_eq!(file_count(&fx.downloads), 0);
    assert_eq!(state, SessionState::Authenticated);
}

#[test]
fn wrong_credentials_fail_each_month() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    portal.secret = "other".to_string();
    let range = DateRange::new(2024, 1, 2024, 3).unwrap();

    let (report, state) = extract(&mut portal, &fx, LedgerKind::Sales, &range);
    let report = report.unwrap();

    assert_eq!(report.failed.len(), 3);
    assert_eq!(portal.logins, 0);
    assert_eq!(state, SessionState::NotAuthenticated);
}

#[test]
fn interrupt_stops_the_run() {
    let fx = fixture();
    let mut portal = FakePortal::new(&fx.downloads);
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let range = DateRange::new(2024, 1, 2024, 12).unwrap();

    let mut extraction = Extraction::new(
        &mut portal,
        &fx.account,
        LedgerKind::Sales,
        fx.downloads.clone(),
        fx.debug.clone(),
    )
    .with_timings(Timings::instant())
    .with_interrupt(interrupt);
    let err = extraction.run(&range).unwrap_err();

    assert!(is_interrupted(&err));
    assert_eq!(file_count(&fx.downloads), 0);
}
