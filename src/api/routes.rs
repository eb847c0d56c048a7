use super::*;

pub(super) async fn ping(State(bridge): State<Arc<Bridge>>) -> Json<Envelope> {
    Json(Envelope::success(
        "ping",
        serde_json::json!({
            "status": "ok",
            "state": bridge.state(),
            "port": bridge.port(),
        }),
    ))
}

pub(super) async fn invoke_tool(
    State(bridge): State<Arc<Bridge>>,
    Path(name): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                rejection.status(),
                Json(Envelope::failure("invalid_body", rejection.body_text())),
            )
                .into_response()
        }
    };
    let params = match parse_body(&body) {
        Ok(params) => params,
        Err(rejection) => return rejection,
    };
    respond(&name, bridge.dispatch(Route::Tool, &name, params).await)
}

pub(super) async fn read_resource(
    State(bridge): State<Arc<Bridge>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let params = Value::Object(
        query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    respond(&name, bridge.dispatch(Route::Resource, &name, params).await)
}

pub(super) async fn unknown_route(req: Request) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(Envelope::failure(
            "not_found",
            format!("no route for {} {}", req.method(), req.uri().path()),
        )),
    )
        .into_response()
}

pub(super) async fn wrong_method(req: Request) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(Envelope::failure(
            "method_not_allowed",
            format!("{} is not allowed on {}", req.method(), req.uri().path()),
        )),
    )
        .into_response()
}

/// Handler failures are still a 200: the envelope carries `success: false`.
fn respond(name: &str, result: Result<Value, BridgeError>) -> Response {
    match result {
        Ok(data) => Json(Envelope::success(name, data)).into_response(),
        Err(err) => {
            debug!("[Conduit API] {name} failed: {err}");
            Json(Envelope::from_error(&err)).into_response()
        }
    }
}

/// Empty body means no parameters. Unparseable JSON is a 400; valid JSON
/// that is not an object is a regular `invalid_params` failure.
fn parse_body(body: &[u8]) -> Result<Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(Json(Envelope::failure(
            "invalid_params",
            "request body must be a JSON object",
        ))
        .into_response()),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(Envelope::failure("invalid_json", format!("malformed JSON body: {e}"))),
        )
            .into_response()),
    }
}
