//! 面包屑导航与上级目录链接。

use crate::http::encode_path;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breadcrumb {
    pub label: String,
    pub url: String,
}

/// 将 URL 路径拆分为逐级导航段，首段始终为根 `/`。
pub fn build_breadcrumbs(url_path: &str) -> Vec<Breadcrumb> {
    let mut crumbs = vec![Breadcrumb {
        label: "/".into(),
        url: "/".into(),
    }];
    let clean = url_path.trim_matches('/');
    if clean.is_empty() {
        return crumbs;
    }

    let mut current = String::from("/");
    for segment in clean.split('/') {
        current.push_str(segment);
        current.push('/');
        crumbs.push(Breadcrumb {
            label: format!("{segment}/"),
            url: encode_path(&current),
        });
    }
    crumbs
}

/// 返回上级目录的 URL；根目录与一级目录都指向 `/`。
pub fn parent_url(url_path: &str) -> String {
    let clean = url_path.trim_matches('/');
    match clean.rsplit_once('/') {
        Some((parent, _)) => encode_path(&format!("/{parent}/")),
        None => "/".into(),
    }
}
