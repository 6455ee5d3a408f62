use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use strata_core::{
    ApplyOutcome, ApplyRequest, Context, DeleteOutcome, Event, GenericObject, GenericObjectList, ListFilter, ObjectKey,
    StrataError, StrataResult,
};
use strata_schema::KindSchema;
use tracing::debug;

use crate::http::{ErrorBody, HEADER_FIELD_MANAGER, HEADER_FORCE_APPLY};
use crate::{DeleteStatus, StrataApi, StreamHandle};

/// [`StrataApi`] over the REST adapter.
#[derive(Clone)]
pub struct HttpClient {
    base: String,
    session: Option<String>,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base: impl Into<String>) -> Self {
        let secs = std::env::var("STRATA_REQUEST_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { base: base.into().trim_end_matches('/').to_string(), session: None, http }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base, path));
        match &self.session {
            Some(s) => req.header(reqwest::header::AUTHORIZATION, s),
            None => req,
        }
    }

    fn object_path(key: &ObjectKey) -> String {
        format!("/v1/objects/{}/{}/{}/{}/{}", key.group, key.version, key.kind, key.account, key.name)
    }

    /// Send and return the status, or the decoded error body.
    async fn send(&self, ctx: &Context, req: RequestBuilder) -> StrataResult<reqwest::Response> {
        ctx.check()?;
        let req = match ctx.remaining() {
            Some(r) => req.timeout(r),
            None => req,
        };
        let resp = ctx.run(async { req.send().await.map_err(transport) }).await?;
        let status = resp.status();
        debug!(url = %resp.url(), status = status.as_u16(), "http client: response");
        if status.is_client_error() || status.is_server_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) if body.error == "unauthorized" => StrataError::Validation(body.message),
                Ok(body) => body.into_error(),
                Err(_) => StrataError::from_status(status.as_u16(), text),
            });
        }
        Ok(resp)
    }

    async fn json<T: DeserializeOwned>(&self, ctx: &Context, req: RequestBuilder) -> StrataResult<T> {
        let resp = self.send(ctx, req).await?;
        resp.json::<T>().await.map_err(|e| StrataError::Transport(format!("decoding response: {e}")))
    }
}

fn transport(e: reqwest::Error) -> StrataError {
    if e.is_timeout() {
        StrataError::Transport("deadline exceeded".into())
    } else {
        StrataError::Transport(format!("{e}"))
    }
}

#[async_trait::async_trait]
impl StrataApi for HttpClient {
    async fn get(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<GenericObject> {
        key.validate_strict()?;
        self.json(ctx, self.request(Method::GET, &Self::object_path(key))).await
    }

    async fn list(&self, ctx: &Context, filter: &ListFilter) -> StrataResult<GenericObjectList> {
        filter.key.validate_filter()?;
        let k = &filter.key;
        let mut query: Vec<(&str, &str)> = [
            ("group", k.group.as_str()),
            ("version", k.version.as_str()),
            ("kind", k.kind.as_str()),
            ("account", k.account.as_str()),
            ("name", k.name.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect();
        if let Some(p) = filter.name_prefix.as_deref() {
            query.push(("namePrefix", p));
        }
        self.json(ctx, self.request(Method::GET, "/v1/objects").query(&query)).await
    }

    async fn apply(&self, ctx: &Context, req: ApplyRequest) -> StrataResult<ApplyOutcome> {
        let builder = self
            .request(Method::PATCH, "/v1/objects")
            .header(HEADER_FIELD_MANAGER, req.manager.as_str())
            .header(HEADER_FORCE_APPLY, if req.force { "true" } else { "false" })
            .json(&req.payload);
        let resp = self.send(ctx, builder).await?;
        let status = resp.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(ApplyOutcome::Noop);
        }
        ApplyOutcome::from_status(status.as_u16())
            .ok_or_else(|| StrataError::Transport(format!("unexpected apply status {status}")))
    }

    async fn delete(&self, ctx: &Context, key: &ObjectKey) -> StrataResult<DeleteOutcome> {
        key.validate_strict()?;
        let status: DeleteStatus = self.json(ctx, self.request(Method::DELETE, &Self::object_path(key))).await?;
        Ok(status.outcome)
    }

    async fn watch(&self, _ctx: &Context, _filter: ObjectKey) -> StrataResult<StreamHandle<Event>> {
        Err(StrataError::Validation("watch is not served over HTTP; use the bus transport".into()))
    }

    async fn kinds(&self, ctx: &Context) -> StrataResult<Vec<KindSchema>> {
        self.json(ctx, self.request(Method::GET, "/v1/kinds")).await
    }
}
