//! Route table (§6 "HTTP surface").

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/upload/signed-url", post(handlers::signed_url))
        .route("/api/upload/process", post(handlers::process_upload))
        .route("/api/tasks/:taskId/status", get(handlers::task_status))
        .route("/api/books", get(handlers::list_books))
        .route("/api/books/:bookId", get(handlers::get_book))
        .route("/api/books/:bookId/chapters", get(handlers::list_chapters))
        .route("/api/chapters/:chapterId", get(handlers::get_chapter))
        .route("/api/position", post(handlers::update_position))
        .route("/api/chat/stream", post(handlers::chat_stream))
        .route("/api/notes", post(handlers::create_note))
        .route("/api/notes/auto", post(handlers::create_auto_note))
        .route("/api/notes/search", get(handlers::search_notes))
        .route("/api/notes/:noteId", get(handlers::get_note))
        .route("/api/dialog/history", get(handlers::dialog_history))
}
