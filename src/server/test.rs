use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::*;
use crate::logger::CapturingLogger;
use crate::protocol::RequestId;
use crate::store::SessionId;
use crate::types::{
    CallToolResult, ClientCapabilities, ElicitAction, GetPromptResult, MessageContent,
    PromptMessage, ReadResourceResult, Role,
};

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(Message, Route)>>,
}

impl OutboundSender for Outbox {
    fn send(&self, message: Message, route: &Route) -> Result<(), Error> {
        self.sent.lock().push((message, route.clone()));
        Ok(())
    }
}

fn server_with_logger() -> (McpServer, Arc<CapturingLogger>) {
    let logger = Arc::new(CapturingLogger::default());
    let server = McpServer::new(ServerOptions::new("test", "1.0.0").logger(logger.clone()));
    (server, logger)
}

fn echo_tool(server: &McpServer, name: &str) {
    server.tool(ToolDef::new(name), |args, _ctx| async move {
        Ok(CallToolResult::structured(args))
    });
}

async fn request(server: &McpServer, method: &str, params: Value) -> Response {
    request_in(server, method, params, &DispatchContext::default()).await
}

async fn request_in(
    server: &McpServer,
    method: &str,
    params: Value,
    ctx: &DispatchContext,
) -> Response {
    server
        .dispatch(
            Message::Request(Request::new(method, Some(params), RequestId::Number(1))),
            ctx,
        )
        .await
        .expect("requests always produce a response")
}

fn tool_names(resp: &Response) -> Vec<String> {
    resp.result.as_ref().unwrap()["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

fn init_params(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "capabilities": {},
        "clientInfo": {"name": "tester", "version": "0.0.1"}
    })
}

#[tokio::test]
async fn initialize_negotiates_version() {
    let (server, _) = server_with_logger();
    let resp = request(&server, "initialize", init_params("2025-06-18")).await;
    let result = resp.result.unwrap();
    assert_eq!(result["protocolVersion"], "2025-06-18");
    assert_eq!(result["serverInfo"]["name"], "test");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], true);

    let resp = request(&server, "initialize", init_params("2030-01-01")).await;
    assert_eq!(resp.result.unwrap()["protocolVersion"], "2025-03-26");
}

#[tokio::test]
async fn elicitation_capability_needs_latest_version_and_outbound() {
    let (server, _) = server_with_logger();
    let resp = request(&server, "initialize", init_params("2025-06-18")).await;
    assert!(resp.result.unwrap()["capabilities"].get("elicitation").is_none());

    server.set_outbound(Arc::new(Outbox::default()));
    let resp = request(&server, "initialize", init_params("2025-06-18")).await;
    assert!(resp.result.unwrap()["capabilities"].get("elicitation").is_some());

    let resp = request(&server, "initialize", init_params("2025-03-26")).await;
    assert!(resp.result.unwrap()["capabilities"].get("elicitation").is_none());
}

#[tokio::test]
async fn ping_and_unknown_method() {
    let (server, _) = server_with_logger();
    assert_eq!(request(&server, "ping", json!({})).await.result, Some(json!({})));
    let resp = request(&server, "nope/nothing", json!({})).await;
    assert_eq!(resp.error.unwrap().code, -32601);
}

#[tokio::test]
async fn notifications_and_stray_responses_produce_nothing() {
    let (server, _) = server_with_logger();
    let ctx = DispatchContext::default();
    for method in [
        "notifications/initialized",
        "notifications/cancelled",
        "notifications/progress",
        "notifications/whatever",
    ] {
        let msg = Message::Notification(Notification::new(method, None));
        assert!(server.dispatch(msg, &ctx).await.is_none());
    }
    let stray = Message::Response(Response::success(RequestId::from("x"), json!({})));
    assert!(server.dispatch(stray, &ctx).await.is_none());
}

#[tokio::test]
async fn calls_tool_with_arguments() {
    let (server, _) = server_with_logger();
    echo_tool(&server, "echo");
    let resp = request(
        &server,
        "tools/call",
        json!({"name": "echo", "arguments": {"a": 1}}),
    )
    .await;
    let result = resp.result.unwrap();
    assert_eq!(result["structuredContent"], json!({"a": 1}));
    assert_eq!(result["isError"], false);

    let resp = request(&server, "tools/call", json!({"name": "missing"})).await;
    let err = resp.error.unwrap();
    assert_eq!(err.code, -32601);
    assert!(err.message.contains("missing"));
}

#[tokio::test]
async fn invalid_arguments_list_every_failure() {
    let (server, _) = server_with_logger();
    server.tool(
        ToolDef::new("add").input_schema(json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })),
        |args, _ctx| async move {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            Ok(CallToolResult::text(sum.to_string()))
        },
    );

    let resp = request(
        &server,
        "tools/call",
        json!({"name": "add", "arguments": {"a": "one"}}),
    )
    .await;
    let err = resp.error.unwrap();
    assert_eq!(err.code, -32602);
    assert_eq!(err.data.unwrap()["errors"].as_array().unwrap().len(), 2);

    let ok = request(
        &server,
        "tools/call",
        json!({"name": "add", "arguments": {"a": 1, "b": 2}}),
    )
    .await;
    assert_eq!(ok.result.unwrap()["content"][0]["text"], "3");
}

#[tokio::test]
async fn structured_output_is_checked_against_output_schema() {
    let (server, _) = server_with_logger();
    let schema = json!({
        "type": "object",
        "properties": {"n": {"type": "integer"}},
        "required": ["n"]
    });
    server.tool(
        ToolDef::new("good").output_schema(schema.clone()),
        |_args, _ctx| async move { Ok(CallToolResult::structured(json!({"n": 1}))) },
    );
    server.tool(
        ToolDef::new("bad").output_schema(schema.clone()),
        |_args, _ctx| async move { Ok(CallToolResult::structured(json!({"n": "x"}))) },
    );
    server.tool(
        ToolDef::new("none").output_schema(schema),
        |_args, _ctx| async move { Ok(CallToolResult::text("plain")) },
    );

    assert!(request(&server, "tools/call", json!({"name": "good"}))
        .await
        .result
        .is_some());
    for name in ["bad", "none"] {
        let resp = request(&server, "tools/call", json!({"name": name})).await;
        assert_eq!(resp.error.unwrap().code, -32602, "tool {name}");
    }
}

#[tokio::test]
async fn group_prefixes_names_and_flat_keeps_them() {
    let (parent, _) = server_with_logger();
    let (child, _) = server_with_logger();
    echo_tool(&child, "clone");

    parent.group(Namespace::Prefix("git".into()), &child);
    parent.group(Namespace::Flat, &child);

    let names = tool_names(&request(&parent, "tools/list", json!({})).await);
    assert_eq!(names, vec!["git/clone", "clone"]);

    let resp = request(
        &parent,
        "tools/call",
        json!({"name": "git/clone", "arguments": {"repo": "x"}}),
    )
    .await;
    assert_eq!(resp.result.unwrap()["structuredContent"]["repo"], "x");
}

#[tokio::test]
async fn parent_wins_collisions_with_one_warning() {
    let (parent, logger) = server_with_logger();
    let (child, _) = server_with_logger();
    parent.tool(ToolDef::new("status"), |_a, _c| async move {
        Ok(CallToolResult::text("parent"))
    });
    child.tool(ToolDef::new("status"), |_a, _c| async move {
        Ok(CallToolResult::text("child"))
    });

    parent.group(Namespace::Flat, &child);

    assert_eq!(logger.warnings.lock().len(), 1);
    assert!(logger.warnings.lock()[0].contains("status"));
    let resp = request(&parent, "tools/call", json!({"name": "status"})).await;
    assert_eq!(resp.result.unwrap()["content"][0]["text"], "parent");
}

#[tokio::test]
async fn resources_are_never_renamed_by_groups() {
    let (parent, _) = server_with_logger();
    let (child, _) = server_with_logger();
    child.resource(ResourceDef::new("mem://readme", "readme"), |req, _c| async move {
        Ok(ReadResourceResult::text(req.uri, "hello"))
    });
    parent.group(Namespace::Prefix("docs".into()), &child);

    let resp = request(&parent, "resources/list", json!({})).await;
    assert_eq!(
        resp.result.unwrap()["resources"][0]["uri"],
        "mem://readme"
    );
}

#[tokio::test]
async fn child_middleware_runs_inside_parent_middleware() {
    let (parent, _) = server_with_logger();
    let (child, _) = server_with_logger();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    for (srv, name) in [(&parent, "parent"), (&child, "child")] {
        let log = log.clone();
        srv.use_middleware(move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{name}>{}", ctx.method));
                next.run(ctx).await
            })
        });
    }
    echo_tool(&child, "clone");
    echo_tool(&parent, "local");
    parent.group(Namespace::Prefix("git".into()), &child);

    request(&parent, "tools/call", json!({"name": "git/clone"})).await;
    request(&parent, "tools/call", json!({"name": "local"})).await;
    assert_eq!(
        *log.lock(),
        vec!["parent>tools/call", "child>tools/call", "parent>tools/call"]
    );
}

#[tokio::test]
async fn middleware_that_skips_next_yields_internal_error() {
    let (server, _) = server_with_logger();
    echo_tool(&server, "echo");
    server.use_middleware(|_ctx, _next| Box::pin(async { Ok(()) }));

    let resp = request(&server, "tools/call", json!({"name": "echo"})).await;
    let err = resp.error.unwrap();
    assert_eq!(err.code, -32603);
    assert!(err.message.contains("was not executed"));
    assert!(err.message.contains("did not call next"));
}

#[tokio::test]
async fn middleware_can_reject_and_see_auth() {
    let (server, _) = server_with_logger();
    echo_tool(&server, "echo");
    server.use_middleware(|ctx, next| {
        Box::pin(async move {
            if ctx.auth.is_none() {
                return Err(Error::protocol(ErrorCode::InvalidRequest, "unauthorized"));
            }
            next.run(ctx).await
        })
    });

    let resp = request(&server, "tools/call", json!({"name": "echo"})).await;
    assert_eq!(resp.error.unwrap().message, "unauthorized");

    let ctx = DispatchContext {
        auth: Some(crate::types::AuthInfo {
            token: "t".into(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let resp = request_in(&server, "tools/call", json!({"name": "echo"}), &ctx).await;
    assert!(resp.result.is_some());
}

#[tokio::test]
async fn handler_panics_become_internal_errors() {
    let (server, logger) = server_with_logger();
    server.tool(ToolDef::new("boom"), |_a, _c| async move {
        if true {
            panic!("kaboom");
        }
        Ok(CallToolResult::text("unreachable"))
    });
    let resp = request(&server, "tools/call", json!({"name": "boom"})).await;
    let err = resp.error.unwrap();
    assert_eq!(err.code, -32603);
    assert!(err.message.contains("kaboom"));
    assert_eq!(logger.errors.lock().len(), 1);

    // The server keeps working.
    assert!(request(&server, "ping", json!({})).await.result.is_some());
}

#[tokio::test]
async fn prompts_check_required_arguments() {
    let (server, _) = server_with_logger();
    server.prompt(
        PromptDef::new("greet").argument("name", "who to greet", true),
        |args, _c| async move {
            let name = args.get("name").and_then(Value::as_str).unwrap_or_default();
            Ok(GetPromptResult {
                description: None,
                messages: vec![PromptMessage {
                    role: Role::User,
                    content: MessageContent::text(format!("Hello, {name}")),
                }],
            })
        },
    );

    let list = request(&server, "prompts/list", json!({})).await;
    assert_eq!(list.result.unwrap()["prompts"][0]["arguments"][0]["name"], "name");

    let resp = request(&server, "prompts/get", json!({"name": "greet"})).await;
    assert_eq!(resp.error.unwrap().code, -32602);

    let resp = request(
        &server,
        "prompts/get",
        json!({"name": "greet", "arguments": {"name": "Ada"}}),
    )
    .await;
    assert_eq!(
        resp.result.unwrap()["messages"][0]["content"]["text"],
        "Hello, Ada"
    );
}

#[tokio::test]
async fn resources_match_exact_uri_before_templates() {
    let (server, _) = server_with_logger();
    server.resource(
        ResourceDef::new("users://{id}", "user"),
        |req, _c| async move {
            Ok(ReadResourceResult::text(
                req.uri.clone(),
                format!("user {}", req.variables["id"]),
            ))
        },
    );
    server.resource(ResourceDef::new("users://me", "me"), |req, _c| async move {
        Ok(ReadResourceResult::text(req.uri, "myself"))
    });

    let text = |resp: Response| resp.result.unwrap()["contents"][0]["text"].clone();
    assert_eq!(
        text(request(&server, "resources/read", json!({"uri": "users://me"})).await),
        "myself"
    );
    assert_eq!(
        text(request(&server, "resources/read", json!({"uri": "users://7"})).await),
        "user 7"
    );
    let resp = request(&server, "resources/read", json!({"uri": "other://x"})).await;
    assert_eq!(resp.error.unwrap().code, -32601);

    let list = request(&server, "resources/list", json!({})).await;
    assert_eq!(list.result.unwrap()["resources"].as_array().unwrap().len(), 1);
    let templates = request(&server, "resources/templates/list", json!({})).await;
    assert_eq!(
        templates.result.unwrap()["resourceTemplates"][0]["uriTemplate"],
        "users://{id}"
    );
}

#[tokio::test]
async fn registration_after_initialize_announces_list_changes() {
    let (server, _) = server_with_logger();
    let outbox = Arc::new(Outbox::default());
    server.set_outbound(outbox.clone());

    echo_tool(&server, "before");
    assert!(outbox.sent.lock().is_empty());

    request(&server, "initialize", init_params("2025-06-18")).await;
    echo_tool(&server, "after");

    let (child, _) = server_with_logger();
    echo_tool(&child, "a");
    echo_tool(&child, "b");
    child.prompt(PromptDef::new("p"), |_a, _c| async move {
        Ok(GetPromptResult::default())
    });
    server.group(Namespace::Prefix("kid".into()), &child);

    let sent = outbox.sent.lock();
    let methods: Vec<_> = sent.iter().filter_map(|(m, _)| m.method()).collect();
    assert_eq!(
        methods,
        vec![
            "notifications/tools/list_changed",
            "notifications/tools/list_changed",
            "notifications/prompts/list_changed"
        ]
    );
    assert!(sent.iter().all(|(_, route)| route.global));
}

fn session_ctx(caps: ClientCapabilities) -> DispatchContext {
    DispatchContext {
        session_id: Some(SessionId::new("s1")),
        protocol_version: Some(crate::LATEST_PROTOCOL_VERSION.to_string()),
        client_capabilities: caps,
        auth: None,
        stream: None,
    }
}

fn elicit_tool(server: &McpServer) {
    server.tool(ToolDef::new("ask"), |_args, ctx| async move {
        let answer = ctx
            .elicit("Your name?", json!({"type": "object", "properties": {"name": {"type": "string"}}}))
            .await?;
        match answer.action {
            ElicitAction::Accept => Ok(CallToolResult::structured(Value::Object(
                answer.content.unwrap_or_default(),
            ))),
            _ => Ok(CallToolResult::text("declined")),
        }
    });
}

#[tokio::test]
async fn elicitation_without_client_capability_sends_nothing() {
    let (server, _) = server_with_logger();
    let outbox = Arc::new(Outbox::default());
    server.set_outbound(outbox.clone());
    elicit_tool(&server);

    let resp = request_in(
        &server,
        "tools/call",
        json!({"name": "ask"}),
        &session_ctx(ClientCapabilities::default()),
    )
    .await;
    let err = resp.error.unwrap();
    assert_eq!(err.code, -32603);
    assert_eq!(err.message, "Client does not support elicitation");
    assert!(outbox.sent.lock().is_empty());
    assert_eq!(server.bridge().pending_count(), 0);
}

#[tokio::test]
async fn elicitation_round_trip_through_dispatch() {
    let (server, _) = server_with_logger();
    let outbox = Arc::new(Outbox::default());
    server.set_outbound(outbox.clone());
    elicit_tool(&server);

    let ctx = session_ctx(ClientCapabilities {
        elicitation: Some(json!({})),
        ..Default::default()
    });
    let call = {
        let server = server.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { request_in(&server, "tools/call", json!({"name": "ask"}), &ctx).await })
    };

    let outgoing = loop {
        if let Some(entry) = outbox.sent.lock().first().cloned() {
            break entry;
        }
        tokio::task::yield_now().await;
    };
    let (Message::Request(elicit), route) = outgoing else {
        panic!("expected an elicitation request");
    };
    assert_eq!(elicit.method, "elicitation/create");
    assert_eq!(route.related_request, Some(RequestId::Number(1)));
    assert_eq!(route.session_id, Some(SessionId::new("s1")));

    let answer = Response::success(
        elicit.id.clone(),
        json!({"action": "accept", "content": {"name": "Ada"}}),
    );
    assert!(server.dispatch(Message::Response(answer), &ctx).await.is_none());

    let resp = call.await.unwrap();
    assert_eq!(resp.result.unwrap()["structuredContent"]["name"], "Ada");
}

#[tokio::test]
async fn progress_is_sent_only_with_a_token() {
    let (server, _) = server_with_logger();
    let outbox = Arc::new(Outbox::default());
    server.set_outbound(outbox.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    server.tool(ToolDef::new("work"), move |_a, ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.progress(0.5, Some(1.0), Some("halfway".into()))?;
            Ok(CallToolResult::text("done"))
        }
    });

    request(&server, "tools/call", json!({"name": "work"})).await;
    assert!(outbox.sent.lock().is_empty());

    request(
        &server,
        "tools/call",
        json!({"name": "work", "_meta": {"progressToken": "tok"}}),
    )
    .await;
    let sent = outbox.sent.lock();
    assert_eq!(sent.len(), 1);
    let Message::Notification(n) = &sent[0].0 else {
        panic!("expected progress notification");
    };
    assert_eq!(n.method, "notifications/progress");
    assert_eq!(n.params.as_ref().unwrap()["progressToken"], "tok");
    assert_eq!(sent[0].1.related_request, Some(RequestId::Number(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
