//! 目录页面模型与 HTML 渲染。

use maud::{DOCTYPE, Markup, PreEscaped, Render, html};

use crate::breadcrumb::{Breadcrumb, build_breadcrumbs, parent_url};
use crate::config::{BuildInfo, Settings};
use crate::storage::DirectoryEntry;

const STYLE: &str = include_str!("assets/style.css");
const SCRIPT: &str = include_str!("assets/app.js");
const FAVICON: &str = "data:image/svg+xml,<svg xmlns='http://www.w3.org/2000/svg' viewBox='0 0 16 16'><text y='14' font-size='14'>📁</text></svg>";

/// 运维方提供的可信标记，渲染时不做转义。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMarkup(String);

impl RawMarkup {
    pub fn new(markup: impl Into<String>) -> Self {
        Self(markup.into())
    }
}

impl Render for RawMarkup {
    fn render_to(&self, buffer: &mut String) {
        buffer.push_str(&self.0);
    }
}

/// 单次目录视图所需的全部数据。
pub struct ViewModel<'a> {
    pub current_path: &'a str,
    pub parent_url: String,
    pub entries: Vec<DirectoryEntry>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub title: &'a str,
    pub extra_headers: &'a RawMarkup,
    pub upload_enabled: bool,
    pub build: &'a BuildInfo,
}

impl<'a> ViewModel<'a> {
    pub fn new(current_path: &'a str, entries: Vec<DirectoryEntry>, settings: &'a Settings) -> Self {
        Self {
            current_path,
            parent_url: parent_url(current_path),
            entries,
            breadcrumbs: build_breadcrumbs(current_path),
            title: &settings.title,
            extra_headers: &settings.extra_headers,
            upload_enabled: settings.upload_enabled,
            build: &settings.build,
        }
    }

    fn is_root(&self) -> bool {
        self.current_path == "/"
    }
}

pub fn render(model: &ViewModel<'_>) -> Markup {
    let disabled = !model.upload_enabled;
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                title { (model.title) }
                link rel="icon" href=(FAVICON);
                (model.extra_headers)
                style { (PreEscaped(STYLE)) }
            }
            body {
                header {
                    h1 {
                        @for crumb in &model.breadcrumbs {
                            a href=(crumb.url) { (crumb.label) }
                        }
                    }
                    input #search .search-box type="text" placeholder="Filter by filename..." autocomplete="off";
                    form .upload-form action="/upload" method="post" enctype="multipart/form-data" {
                        input type="hidden" name="dir" value=(model.current_path);
                        input #file-input type="file" name="file" required disabled[disabled];
                        label #file-label .file-input-label .disabled[disabled] for="file-input" {
                            @if disabled { "Uploads disabled" } @else { "Choose file..." }
                        }
                        button type="submit" disabled[disabled] { "Upload" }
                    }
                }
                main {
                    table #file-table {
                        thead {
                            tr {
                                th .name { "Name" }
                                th .size { "Size" }
                                th .date { "Last Modified" }
                            }
                        }
                        tbody {
                            @if !model.is_root() {
                                tr .filerow .parent {
                                    td .name { "📁 " a href=(model.parent_url) { ".." } }
                                    td .size { "-" }
                                    td .date { "-" }
                                }
                            }
                            @for entry in &model.entries {
                                tr .filerow {
                                    td .name {
                                        @if entry.is_dir() { "📁 " } @else { "📄 " }
                                        a href=(entry.relative_url) {
                                            (entry.name)
                                            @if entry.is_dir() { "/" }
                                        }
                                    }
                                    td .size { (entry.display_size) }
                                    td .date { (entry.modified_at) }
                                }
                            }
                        }
                    }
                }
                footer {
                    "Build: " (model.build.commit) " | " (model.build.date)
                    button #theme-toggle .theme-toggle type="button" title="Toggle theme" { "🌓" }
                }
                div #drag-message .drag-message {}
                script { (PreEscaped(SCRIPT)) }
            }
        }
    }
}
