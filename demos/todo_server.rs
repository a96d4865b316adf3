//! Todo API with token auth and a broadcast chat room.
//!
//! ```text
//! cargo run --example todo_server [config.toml]
//!
//! curl -X POST localhost:3000/login -d '{"username":"admin","password":"1234"}'
//! curl localhost:3000/api/v1/todos -H "Authorization: Bearer <token>"
//! websocat ws://localhost:3000/chat
//! ```

use std::sync::Arc;
use std::time::Duration;

use arunika::app::{App, Health};
use arunika::config::{AuthConfig, EngineConfig};
use arunika::context::Context;
use arunika::http::{Response, StatusCode};
use arunika::middleware::{Pipeline, Rejection};
use arunika::realtime::Connection;
use arunika::security::{Claims, FieldType, Schema, token};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const SECRET: &str = "supersecret";

#[derive(Debug, Clone, Serialize)]
struct Todo {
    id: String,
    title: String,
    done: bool,
}

#[derive(Deserialize)]
struct NewTodo {
    title: String,
}

#[derive(Default, Deserialize)]
struct TodoUpdate {
    title: Option<String>,
    done: Option<bool>,
}

#[derive(Deserialize)]
struct Login {
    username: String,
    password: String,
}

type Store = Arc<RwLock<Vec<Todo>>>;

fn not_found() -> Response {
    Rejection::NotFound.into_response()
}

fn todo_routes(app: &mut App, store: &Store) -> Result<(), arunika::AppError> {
    let todos = Arc::clone(store);
    app.get(
        "/api/v1/todos",
        Pipeline::new(move |_ctx| {
            let todos = Arc::clone(&todos);
            async move { Response::json(StatusCode::Ok, &*todos.read().await) }
        }),
    )?;

    let todos = Arc::clone(store);
    app.post(
        "/api/v1/todos",
        Pipeline::new(move |ctx: Context| {
            let todos = Arc::clone(&todos);
            async move {
                let Ok(new) = ctx.json::<NewTodo>() else {
                    return Rejection::Validation(vec!["title must be string".into()]).into_response();
                };
                let todo = Todo {
                    id: Uuid::new_v4().to_string(),
                    title: new.title,
                    done: false,
                };
                todos.write().await.push(todo.clone());
                Response::json(StatusCode::Created, &todo)
            }
        })
        .guard(Schema::new().require("title").field("title", FieldType::String)),
    )?;

    let todos = Arc::clone(store);
    app.get(
        "/api/v1/todos/:id",
        Pipeline::new(move |ctx: Context| {
            let todos = Arc::clone(&todos);
            async move {
                let id = ctx.params().get("id").unwrap_or_default();
                match todos.read().await.iter().find(|t| t.id == id) {
                    Some(todo) => Response::json(StatusCode::Ok, todo),
                    None => not_found(),
                }
            }
        }),
    )?;

    let todos = Arc::clone(store);
    app.put(
        "/api/v1/todos/:id",
        Pipeline::new(move |ctx: Context| {
            let todos = Arc::clone(&todos);
            async move {
                // The schema guard has already accepted the body; an empty one is `{}`.
                let update: TodoUpdate = ctx
                    .body()
                    .and_then(|body| serde_json::from_value(body.clone()).ok())
                    .unwrap_or_default();
                let id = ctx.params().get("id").unwrap_or_default();
                let mut todos = todos.write().await;
                let Some(todo) = todos.iter_mut().find(|t| t.id == id) else {
                    return not_found();
                };
                if let Some(title) = update.title {
                    todo.title = title;
                }
                if let Some(done) = update.done {
                    todo.done = done;
                }
                Response::json(StatusCode::Ok, &*todo)
            }
        })
        .guard(
            Schema::new()
                .field("title", FieldType::String)
                .field("done", FieldType::Boolean),
        ),
    )?;

    let todos = Arc::clone(store);
    app.delete(
        "/api/v1/todos/:id",
        Pipeline::new(move |ctx: Context| {
            let todos = Arc::clone(&todos);
            async move {
                let id = ctx.params().get("id").unwrap_or_default().to_owned();
                todos.write().await.retain(|t| t.id != id);
                Response::new(StatusCode::NoContent)
            }
        }),
    )?;

    Ok(())
}

async fn login(ctx: Context) -> Response {
    let unauthorized = || Response::json(StatusCode::Unauthorized, &json!({ "error": "Unauthorized" }));
    let Ok(Login { username, password }) = ctx.json::<Login>() else {
        return unauthorized();
    };
    if username != "admin" || password != "1234" {
        return unauthorized();
    }

    let claims = Claims::new().with("user", username);
    match token::sign(&claims, SECRET.as_bytes(), Some(Duration::from_secs(3600))) {
        Ok(token) => Response::json(StatusCode::Ok, &json!({ "token": token })),
        Err(e) => {
            tracing::error!(error = %e, "failed to issue token");
            Response::new(StatusCode::InternalServerError)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig {
            auth: Some(AuthConfig {
                secret: SECRET.to_owned(),
                prefix: "/api".to_owned(),
            }),
            ..EngineConfig::default()
        },
    };

    let mut app = App::from_config(&config);
    app.plugin(Health::new())?;
    app.post("/login", Pipeline::new(login))?;

    let store: Store = Arc::default();
    todo_routes(&mut app, &store)?;

    let registry = app.registry();
    app.ws("/chat", move |mut conn: Connection| {
        let registry = registry.clone();
        async move {
            let _ = conn.send("Welcome to Arunika Chat!");
            while let Some(text) = conn.recv_text().await {
                registry.broadcast(conn.path(), text);
            }
        }
    })?;

    tracing::info!("todo API at http://{}/api/v1/todos, chat at ws://{}/chat", config.listen, config.listen);
    app.listen(&config.listen).await?;
    Ok(())
}
