//! Shared fixtures for the tunnel integration tests.


use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use pb::sync_request::Action;
use pb::todo_service_server::TodoService;
use pb::{
    BulkCreateRequest, BulkCreateResponse, CreateTodoRequest, CreateTodoResponse,
    ListTodosRequest, SyncRequest, SyncResponse, Todo,
};

/// Builds a todo in one line.
pub fn todo(id: &str, text: &str) -> Todo {
    Todo {
        id: id.to_owned(),
        text: text.to_owned(),
        done: false,
    }
}

/// In-memory Todo service backing the integration tests.
pub struct TodoSvc {
    list: Vec<Todo>,
    next_id: AtomicU64,
}

impl TodoSvc {
    pub fn new() -> Self {
        Self::with_list(Vec::new())
    }

    /// A service whose `ListTodos` streams the given todos in order.
    pub fn with_list(list: Vec<Todo>) -> Self {
        Self {
            list,
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for TodoSvc {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl TodoService for TodoSvc {
    async fn create_todo(
        &self,
        request: Request<CreateTodoRequest>,
    ) -> Result<Response<CreateTodoResponse>, Status> {
        let text = request.into_inner().text;
        if text.is_empty() {
            return Err(Status::invalid_argument("text must not be empty"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Response::new(CreateTodoResponse {
            todo: Some(Todo {
                id: format!("todo-{id}"),
                text,
                done: false,
            }),
        }))
    }

    type ListTodosStream = Pin<Box<dyn Stream<Item = Result<Todo, Status>> + Send>>;

    async fn list_todos(
        &self,
        _request: Request<ListTodosRequest>,
    ) -> Result<Response<Self::ListTodosStream>, Status> {
        let todos = self.list.clone();
        Ok(Response::new(Box::pin(tokio_stream::iter(
            todos.into_iter().map(Ok),
        ))))
    }

    async fn bulk_create_todos(
        &self,
        request: Request<Streaming<BulkCreateRequest>>,
    ) -> Result<Response<BulkCreateResponse>, Status> {
        let mut stream = request.into_inner();

        let mut created_count = 0;
        while stream.message().await?.is_some() {
            created_count += 1;
        }

        Ok(Response::new(BulkCreateResponse { created_count }))
    }

    type SyncTodosStream = ReceiverStream<Result<SyncResponse, Status>>;

    async fn sync_todos(
        &self,
        request: Request<Streaming<SyncRequest>>,
    ) -> Result<Response<Self::SyncTodosStream>, Status> {
        let mut stream = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok(Some(req)) = stream.message().await {
                let result = match req.action {
                    Some(Action::Create(create)) => pb::sync_response::Result::Todo(Todo {
                        id: "1".to_owned(),
                        text: create.text,
                        done: false,
                    }),
                    Some(Action::Update(update)) => pb::sync_response::Result::Todo(Todo {
                        id: update.id,
                        text: String::new(),
                        done: update.done,
                    }),
                    Some(Action::Delete(_)) => pb::sync_response::Result::Deleted(true),
                    None => continue,
                };

                let reply = SyncResponse {
                    result: Some(result),
                };
                if tx.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
