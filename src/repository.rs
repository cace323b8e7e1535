//! Repository descriptor documents (AltStore-style source JSON).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRepository")]
pub struct Repository {
    pub name: String,
    pub identifier: String,
    #[serde(rename = "sourceicon", skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(rename = "sourceURL", skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(rename = "unlockURL", skip_serializing_if = "Option::is_none")]
    pub unlock_url: Option<String>,
    #[serde(rename = "payURL", skip_serializing_if = "Option::is_none")]
    pub pay_url: Option<String>,
    #[serde(rename = "message", skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "tintColor", skip_serializing_if = "Option::is_none")]
    pub tint_color: Option<String>,
    #[serde(rename = "featuredApps", skip_serializing_if = "Option::is_none")]
    pub featured_apps: Option<Vec<String>>,
    pub apps: Vec<App>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub news: Option<Vec<NewsItem>>,
}

/// Wire shape; both icon keys are accepted and `sourceicon` wins.
#[derive(Deserialize)]
struct RawRepository {
    name: String,
    identifier: String,
    sourceicon: Option<String>,
    #[serde(rename = "iconURL")]
    icon_url: Option<String>,
    #[serde(rename = "sourceURL")]
    website: Option<String>,
    #[serde(rename = "unlockURL")]
    unlock_url: Option<String>,
    #[serde(rename = "payURL")]
    pay_url: Option<String>,
    message: Option<String>,
    description: Option<String>,
    #[serde(rename = "tintColor")]
    tint_color: Option<String>,
    #[serde(rename = "featuredApps")]
    featured_apps: Option<Vec<String>>,
    #[serde(default)]
    apps: Vec<App>,
    news: Option<Vec<NewsItem>>,
}

impl From<RawRepository> for Repository {
    fn from(raw: RawRepository) -> Self {
        Self {
            name: raw.name,
            identifier: raw.identifier,
            icon_url: raw.sourceicon.or(raw.icon_url),
            website: raw.website,
            unlock_url: raw.unlock_url,
            pay_url: raw.pay_url,
            subtitle: raw.message,
            description: raw.description,
            tint_color: raw.tint_color,
            featured_apps: raw.featured_apps,
            apps: raw.apps,
            news: raw.news,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub name: String,
    pub bundle_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_description: Option<String>,
    #[serde(rename = "downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localized_description: Option<String>,
    #[serde(rename = "iconURL", default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Vec<AppVersion>>,
    #[serde(rename = "screenshotURLs", default, skip_serializing_if = "Option::is_none")]
    pub screenshot_urls: Option<Vec<String>>,
}

impl App {
    pub fn display_description(&self) -> Option<&str> {
        self.description
            .as_deref()
            .or(self.localized_description.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppVersion {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localized_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub title: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tint_color: Option<String>,
    #[serde(rename = "imageURL", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "appID", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<bool>,
}

impl Repository {
    /// Same name (case and surrounding whitespace ignored), same identifier,
    /// or a similar name with the same icon.
    pub fn is_duplicate_of(&self, other: &Repository) -> bool {
        normalize_name(&self.name) == normalize_name(&other.name)
            || self.identifier == other.identifier
            || (similar_names(&self.name, &other.name)
                && icons_match(self.icon_url.as_deref(), other.icon_url.as_deref())
                && both_icons_valid(self.icon_url.as_deref(), other.icon_url.as_deref()))
    }
}

/// Returns every repository that duplicates an earlier one, either by content
/// or because its identifier maps to an already seen source URL.
pub fn find_duplicates<'a>(
    repositories: &'a [Repository],
    url_by_identifier: &HashMap<String, String>,
) -> Vec<&'a Repository> {
    let mut duplicates = Vec::new();
    let mut seen_urls = HashSet::new();

    for (index, repository) in repositories.iter().enumerate() {
        if repositories[..index]
            .iter()
            .any(|previous| repository.is_duplicate_of(previous))
        {
            duplicates.push(repository);
            continue;
        }

        if let Some(url) = url_by_identifier.get(&repository.identifier) {
            if !seen_urls.insert(url.as_str()) {
                duplicates.push(repository);
            }
        }
    }

    duplicates
}

/// Keeps the first repository per identifier and per normalized name.
pub fn remove_duplicates(repositories: Vec<Repository>) -> Vec<Repository> {
    let mut seen_identifiers = HashSet::new();
    let mut seen_names = HashSet::new();

    repositories
        .into_iter()
        .filter(|repo| {
            let name = normalize_name(&repo.name);
            if seen_identifiers.contains(&repo.identifier) || seen_names.contains(&name) {
                return false;
            }
            seen_identifiers.insert(repo.identifier.clone());
            seen_names.insert(name);
            true
        })
        .collect()
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn similar_names(a: &str, b: &str) -> bool {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return true;
    }

    if (a.contains(&b) && b.chars().count() > 3) || (b.contains(&a) && a.chars().count() > 3) {
        return true;
    }

    [' ', '-', '_'].iter().any(|sep| {
        let a = a.replace(*sep, "");
        let b = b.replace(*sep, "");
        a == b && a.chars().count() > 3
    })
}

fn normalize_icon(url: &str) -> String {
    url.trim().to_lowercase().replace("http://", "https://")
}

fn icons_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => normalize_icon(a) == normalize_icon(b),
        _ => false,
    }
}

fn both_icons_valid(a: Option<&str>, b: Option<&str>) -> bool {
    let valid = |url: Option<&str>| {
        url.map(str::trim).is_some_and(|u| {
            !u.is_empty() && (u.starts_with("http://") || u.starts_with("https://"))
        })
    };
    valid(a) && valid(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, identifier: &str, icon: Option<&str>) -> Repository {
        Repository {
            name: name.to_string(),
            identifier: identifier.to_string(),
            icon_url: icon.map(str::to_string),
            website: None,
            unlock_url: None,
            pay_url: None,
            subtitle: None,
            description: None,
            tint_color: None,
            featured_apps: None,
            apps: Vec::new(),
            news: None,
        }
    }

    #[test]
    fn sourceicon_wins_over_icon_url() {
        let json = r#"{
            "name": "Repo",
            "identifier": "com.example.repo",
            "sourceicon": "https://a/icon.png",
            "iconURL": "https://b/icon.png"
        }"#;
        let repo: Repository = serde_json::from_str(json).unwrap();
        assert_eq!(repo.icon_url.as_deref(), Some("https://a/icon.png"));
        assert!(repo.apps.is_empty());
    }

    #[test]
    fn icon_url_is_the_fallback() {
        let json = r#"{"name":"Repo","identifier":"id","iconURL":"https://b/icon.png","apps":[]}"#;
        let repo: Repository = serde_json::from_str(json).unwrap();
        assert_eq!(repo.icon_url.as_deref(), Some("https://b/icon.png"));
    }

    #[test]
    fn decodes_apps_and_news() {
        let json = r#"{
            "name": "Repo",
            "identifier": "id",
            "message": "hello",
            "apps": [{
                "name": "Demo",
                "bundleIdentifier": "com.example.demo",
                "downloadURL": "https://example.com/demo.ipa",
                "localizedDescription": "A demo",
                "size": 1024,
                "versions": [{"version": "1.0", "size": 1024}],
                "screenshotURLs": ["https://example.com/1.png"]
            }],
            "news": [{"title": "Hi", "identifier": "n1", "appID": "com.example.demo"}]
        }"#;
        let repo: Repository = serde_json::from_str(json).unwrap();
        assert_eq!(repo.subtitle.as_deref(), Some("hello"));
        let app = &repo.apps[0];
        assert_eq!(app.bundle_identifier, "com.example.demo");
        assert_eq!(app.display_description(), Some("A demo"));
        assert_eq!(app.versions.as_ref().unwrap()[0].version, "1.0");
        assert_eq!(
            repo.news.as_ref().unwrap()[0].app_id.as_deref(),
            Some("com.example.demo")
        );
    }

    #[test]
    fn serializes_icon_as_sourceicon() {
        let value = serde_json::to_value(repo("Repo", "id", Some("https://a/i.png"))).unwrap();
        assert_eq!(value["sourceicon"], "https://a/i.png");
        assert!(value.get("iconURL").is_none());
    }

    #[test]
    fn duplicate_rules() {
        let a = repo("My Repo", "a", None);
        assert!(a.is_duplicate_of(&repo("  my repo ", "b", None)));
        assert!(a.is_duplicate_of(&repo("Other", "a", None)));
        assert!(!a.is_duplicate_of(&repo("Other", "b", None)));

        let icon = Some("http://cdn/icon.png");
        let b = repo("My-Repo", "x", icon);
        let c = repo("MyRepo", "y", Some("https://CDN/icon.png"));
        assert!(b.is_duplicate_of(&c));
        assert!(!b.is_duplicate_of(&repo("MyRepo", "y", None)));
    }

    #[test]
    fn find_duplicates_checks_urls_too() {
        let repos = vec![
            repo("One", "1", None),
            repo("Two", "2", None),
            repo("one", "3", None),
        ];
        let mut urls = HashMap::new();
        urls.insert("1".to_string(), "https://a/repo.json".to_string());
        urls.insert("2".to_string(), "https://a/repo.json".to_string());

        let dups: Vec<&str> = find_duplicates(&repos, &urls)
            .into_iter()
            .map(|r| r.identifier.as_str())
            .collect();
        assert_eq!(dups, vec!["2", "3"]);
    }

    #[test]
    fn remove_duplicates_keeps_first() {
        let repos = vec![
            repo("One", "1", None),
            repo("ONE ", "2", None),
            repo("Two", "1", None),
            repo("Three", "3", None),
        ];
        let kept: Vec<String> = remove_duplicates(repos)
            .into_iter()
            .map(|r| r.identifier)
            .collect();
        assert_eq!(kept, vec!["1", "3"]);
    }
}
