//! Verification Engine
//!
//! Post-apply probes against the external REST, auth and function services:
//! liveness, cross-identity RLS isolation, function dry-run smoke calls and
//! operator-declared HTTP assertions. Every probe is individually wrapped; an
//! error inside one becomes a failed probe and the run continues.

pub mod identity;

use crate::config::ServiceConfig;
use crate::error::{AppError, AppResult};
use crate::plan::{RlsCheck, SmokeAssertion, VerificationSpec};
use identity::ProbeIdentity;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Liveness,
    Rls,
    Function,
    Smoke,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub name: String,
    pub kind: ProbeKind,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub probes: Vec<ProbeResult>,
    pub passed: usize,
    pub failed: usize,
    pub success: bool,
}

impl VerificationReport {
    fn push(&mut self, probe: ProbeResult) {
        if probe.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.probes.push(probe);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeResult> {
        self.probes.iter().filter(|p| !p.passed)
    }
}

/// Bearer choice for a request
enum Auth<'a> {
    None,
    Anon,
    User(&'a ProbeIdentity),
    Literal(&'a str),
}

pub struct VerificationEngine {
    client: Client,
    services: ServiceConfig,
}

impl VerificationEngine {
    pub fn new(services: &ServiceConfig) -> AppResult<Self> {
        if services.api_url.is_none() {
            return Err(AppError::Config(
                "services.api_url must be set to run verification".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(services.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            services: services.clone(),
        })
    }

    fn request(&self, method: Method, url: &str, auth: Auth<'_>) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.services.anon_key {
            req = req.header("apikey", key);
        }
        match auth {
            Auth::None => req,
            Auth::Anon => match &self.services.anon_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            },
            Auth::User(id) => req.header("Authorization", id.bearer()),
            Auth::Literal(token) => req.bearer_auth(token),
        }
    }

    fn require(url: Option<String>, what: &str) -> AppResult<String> {
        url.ok_or_else(|| AppError::VerificationProbe(format!("{} URL is not configured", what)))
    }

    fn mint(&self) -> AppResult<ProbeIdentity> {
        let secret = self
            .services
            .jwt_secret
            .as_deref()
            .ok_or_else(|| AppError::VerificationProbe("JWT secret is not configured; cannot mint probe identities".to_string()))?;
        identity::mint(secret)
    }

    /// Run liveness plus every declared probe, sequentially
    pub async fn run(&self, spec: &VerificationSpec) -> VerificationReport {
        let mut report = VerificationReport::default();

        for (name, url, strict) in [
            ("rest", self.services.rest_url().map(|u| format!("{}/", u)), false),
            ("auth", self.services.auth_url().map(|u| format!("{}/health", u)), true),
            ("functions", self.services.functions_url().map(|u| format!("{}/", u)), false),
        ] {
            if let Some(url) = url {
                let started = Instant::now();
                let outcome = self.liveness(&url, strict).await;
                report.push(finish(format!("liveness:{}", name), ProbeKind::Liveness, outcome, started));
            }
        }

        for check in &spec.rls {
            let started = Instant::now();
            let outcome = self.rls_boundary(check).await;
            report.push(finish(format!("rls:{}", check.table), ProbeKind::Rls, outcome, started));
        }

        for function in &spec.functions {
            let started = Instant::now();
            let outcome = self.function_smoke(function).await;
            report.push(finish(format!("function:{}", function), ProbeKind::Function, outcome, started));
        }

        for assertion in &spec.smoke {
            let started = Instant::now();
            let outcome = self.smoke(assertion).await;
            report.push(finish(
                format!("smoke:{} {}", assertion.method.to_ascii_uppercase(), assertion.path),
                ProbeKind::Smoke,
                outcome,
                started,
            ));
        }

        report.success = report.failed == 0;
        info!(
            "Verification finished: {} passed, {} failed",
            report.passed, report.failed
        );
        report
    }

    async fn liveness(&self, url: &str, strict: bool) -> AppResult<String> {
        let status = self.request(Method::GET, url, Auth::Anon).send().await?.status();
        let ok = if strict { status.is_success() } else { !status.is_server_error() };
        if ok {
            Ok(format!("{} -> {}", url, status.as_u16()))
        } else {
            Err(AppError::VerificationProbe(format!("{} answered {}", url, status)))
        }
    }

    /// A inserts and reads back its own row; B must not see it
    async fn rls_boundary(&self, check: &RlsCheck) -> AppResult<String> {
        let rest = Self::require(self.services.rest_url(), "REST")?;
        let a = self.mint()?;
        let b = self.mint()?;
        let table_url = format!("{}/{}", rest, check.table);
        let filter = format!("{}=eq.{}", check.owner_col, a.user_id);

        let mut row = check.row.clone();
        row.insert(check.owner_col.clone(), Value::String(a.user_id.to_string()));

        let resp = self
            .request(Method::POST, &table_url, Auth::User(&a))
            .header("Prefer", "return=representation")
            .json(&Value::Object(row))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::VerificationProbe(format!(
                "insert as owner answered {}: {}",
                status,
                resp.text().await.unwrap_or_default()
            )));
        }

        let read_url = format!("{}?{}", table_url, filter);
        let outcome = self.isolation(&read_url, &a, &b).await;

        // Cleanup never decides the probe
        let cleanup = self.request(Method::DELETE, &read_url, Auth::User(&a)).send().await;
        let cleanup_note = match cleanup {
            Ok(resp) if resp.status().is_success() => String::new(),
            Ok(resp) => format!(" (cleanup answered {})", resp.status()),
            Err(e) => format!(" (cleanup failed: {})", e),
        };
        if !cleanup_note.is_empty() {
            warn!("RLS probe cleanup on {}{}", check.table, cleanup_note);
        }

        match outcome {
            Ok(detail) => Ok(format!("{}{}", detail, cleanup_note)),
            Err(AppError::VerificationProbe(msg)) => Err(AppError::VerificationProbe(format!("{}{}", msg, cleanup_note))),
            Err(e) => Err(e),
        }
    }

    async fn isolation(&self, read_url: &str, a: &ProbeIdentity, b: &ProbeIdentity) -> AppResult<String> {
        let own = self.rows(read_url, a).await?;
        if own.is_empty() {
            return Err(AppError::VerificationProbe("owner could not read back its own row".to_string()));
        }
        let foreign = self.rows(read_url, b).await?;
        if !foreign.is_empty() {
            return Err(AppError::VerificationProbe(format!(
                "second identity read {} row(s) owned by the first",
                foreign.len()
            )));
        }
        Ok(format!("owner sees {} row(s); second identity sees none", own.len()))
    }

    async fn rows(&self, url: &str, who: &ProbeIdentity) -> AppResult<Vec<Value>> {
        let resp = self.request(Method::GET, url, Auth::User(who)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::VerificationProbe(format!("read answered {}", status)));
        }
        match resp.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            other => Err(AppError::VerificationProbe(format!("expected a JSON array, got {}", other))),
        }
    }

    async fn function_smoke(&self, name: &str) -> AppResult<String> {
        let base = Self::require(self.services.functions_url(), "Functions")?;
        let url = format!("{}/{}", base, name);
        let caller = self.mint().ok();
        let auth = match &caller {
            Some(id) => Auth::User(id),
            None => Auth::Anon,
        };
        let status = self
            .request(Method::POST, &url, auth)
            .json(&json!({ "dryRun": true }))
            .send()
            .await?
            .status();
        if status.is_success() {
            Ok(format!("dry run answered {}", status.as_u16()))
        } else {
            Err(AppError::VerificationProbe(format!("dry run answered {}", status)))
        }
    }

    async fn smoke(&self, assertion: &SmokeAssertion) -> AppResult<String> {
        let url = Self::require(self.services.url_for(&assertion.path), "API")?;
        let method = Method::from_bytes(assertion.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| AppError::VerificationProbe(format!("unknown HTTP method {}", assertion.method)))?;

        let user;
        let auth = match assertion.token.as_deref() {
            None => Auth::None,
            Some("anon") => Auth::Anon,
            Some("user") => {
                user = self.mint()?;
                Auth::User(&user)
            }
            Some(literal) => Auth::Literal(literal),
        };

        let mut req = self.request(method, &url, auth);
        if let Some(body) = &assertion.body {
            req = req.json(body);
        }
        let status = req.send().await?.status();
        let expected = StatusCode::from_u16(assertion.expect)
            .map_err(|_| AppError::VerificationProbe(format!("invalid expected status {}", assertion.expect)))?;

        debug!("Smoke {} -> {}", url, status);
        if status == expected {
            Ok(format!("answered {}", status.as_u16()))
        } else {
            Err(AppError::VerificationProbe(format!(
                "expected {}, got {}",
                expected.as_u16(),
                status.as_u16()
            )))
        }
    }
}

fn finish(name: String, kind: ProbeKind, result: AppResult<String>, started: Instant) -> ProbeResult {
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(detail) => ProbeResult {
            name,
            kind,
            passed: true,
            detail,
            duration_ms,
        },
        Err(e) => {
            warn!("Probe {} failed: {}", name, e);
            ProbeResult {
                name,
                kind,
                passed: false,
                detail: e.to_string(),
                duration_ms,
            }
        }
    }
}
