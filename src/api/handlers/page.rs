use axum::response::Html;

const INDEX_HTML: &str = include_str!("../../../static/index.html");

/// Upload page: file picker, preview, Extract button and result panel
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}
