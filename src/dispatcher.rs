//! 请求分发：中间件链、Basic 认证、按用户的目录限制与限速。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::auth::{AuthError, AuthService};
use crate::config::ServerConf;
use crate::error::ApiError;
use crate::files::serve_confined;
use crate::prefix::{build_http_path_prefix, normalize_prefix, strip_path_prefix};
use crate::ratelimit::{LimitPolicy, LimiterRegistry, throttle_body};

/// 包装处理器得到新处理器；后注册的在最外层，最先看到请求。
pub type Middleware = Box<dyn FnOnce(Router) -> Router + Send>;

/// 每个请求共享的只读上下文，外加按用户缓存的限速器。
pub struct ServeContext {
    auth: Arc<dyn AuthService>,
    root: PathBuf,
    server_prefix: String,
    limiters: LimiterRegistry,
    limit_policy: LimitPolicy,
}

/// 认证通过后解析出的用户授权信息。
struct Grant {
    root: PathBuf,
    prefix: String,
    speed_limit: u64,
    show_directory: bool,
}

pub struct RequestDispatcher {
    context: Arc<ServeContext>,
    middlewares: Vec<Middleware>,
}

impl RequestDispatcher {
    pub fn new(auth: Arc<dyn AuthService>, root: PathBuf, server: &ServerConf) -> Self {
        let context = ServeContext {
            auth,
            root,
            server_prefix: normalize_prefix(&server.path),
            limiters: LimiterRegistry::new(server.bucket_capacity(), server.pacing_interval()),
            limit_policy: server.limit_policy,
        };
        Self {
            context: Arc::new(context),
            middlewares: Vec::new(),
        }
    }

    pub fn add_middleware<F>(&mut self, middleware: F)
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.middlewares.push(Box::new(middleware));
    }

    /// 按注册顺序逐层包装文件处理器。
    pub fn into_router(self) -> Router {
        let handler = Router::new()
            .fallback(dispatch)
            .with_state(self.context);
        self.middlewares
            .into_iter()
            .fold(handler, |handler, middleware| middleware(handler))
    }

    #[cfg(test)]
    fn context(&self) -> Arc<ServeContext> {
        self.context.clone()
    }
}

async fn dispatch(
    State(context): State<Arc<ServeContext>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    debug!(method = %req.method(), path = req.uri().path(), "request");
    if !context.auth.is_enabled() {
        let remainder = strip_path_prefix(req.uri().path(), &context.server_prefix)
            .ok_or_else(|| ApiError::NotFound("not found".into()))?
            .to_string();
        return serve_confined(&context.root, &remainder, true, req).await;
    }

    let Some(credentials) = req.headers().typed_get::<Authorization<Basic>>() else {
        return Err(ApiError::Unauthorized);
    };
    let username = credentials.username().to_string();
    context
        .authenticate(username.clone(), credentials.password().to_string())
        .await?;

    let grant = context.grant(&username)?;
    let limiter = context.limiters.get_or_create(&username, grant.speed_limit);
    let remainder = strip_path_prefix(req.uri().path(), &grant.prefix)
        .ok_or_else(|| ApiError::NotFound("not found".into()))?
        .to_string();
    debug!(
        username = %username,
        root = %grant.root.display(),
        prefix = %grant.prefix,
        cached_limiters = context.limiters.len(),
        "authorized request"
    );

    let response = serve_confined(&grant.root, &remainder, grant.show_directory, req).await?;
    let policy = context.limit_policy;
    Ok(response.map(|body| throttle_body(body, limiter, policy)))
}

impl ServeContext {
    /// bcrypt 比较较慢，放到阻塞线程池执行。
    async fn authenticate(&self, username: String, password: String) -> Result<(), ApiError> {
        let auth = self.auth.clone();
        let name = username.clone();
        let result = tokio::task::spawn_blocking(move || auth.authenticate(&name, &password))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        match result {
            Ok(()) => Ok(()),
            Err(err @ AuthError::UnsupportedHashMethod(_)) => {
                error!(username = %username, error = %err, "user record is misconfigured");
                Err(ApiError::Unauthorized)
            }
            Err(err) => {
                warn!(username = %username, error = %err, "unauthorized");
                Err(ApiError::Unauthorized)
            }
        }
    }

    fn grant(&self, username: &str) -> Result<Grant, ApiError> {
        let internal = |err: AuthError| {
            error!(username, error = %err, "authenticated user could not be resolved");
            ApiError::Internal("Internal Error.".into())
        };
        let sub_dir = self.auth.authorized_sub_dir(username).map_err(internal)?;
        let user_prefix = self.auth.path_prefix(username).map_err(internal)?;
        let speed_limit = self.auth.speed_limit(username).map_err(internal)?;
        let show_directory = self.auth.can_list_directory(username).map_err(internal)?;
        Ok(Grant {
            root: self.root.join(sub_dir),
            prefix: build_http_path_prefix(&self.server_prefix, &user_prefix),
            speed_limit,
            show_directory,
        })
    }
}
