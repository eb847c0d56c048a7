use super::*;

pub(crate) fn build_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/bridge/ping", get(ping))
        .route("/bridge/tools/{name}", post(invoke_tool))
        .route("/bridge/resources/{name}", get(read_resource))
        .fallback(unknown_route)
        .method_not_allowed_fallback(wrong_method)
        .with_state(bridge)
        .layer(middleware::from_fn(cors))
}
