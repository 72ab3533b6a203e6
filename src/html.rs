//! The HTML shell of a game and its favicons.
//!
//! Generating favicons is slow, so [`regenerate`] only does it when the icon
//! was created or modified in this build, or the metadata baked into the
//! shell changed.

use std::collections::HashSet;
use std::fmt::Write as _;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::BuildName;
use crate::error::{RegenerateError, WriteError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Developer {
    pub name: String,
    pub url: String,
}

/// Metadata of a game, as shown by its HTML shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HtmlMetadata {
    pub title: String,
    pub description: String,
    pub developer: Developer,
}

/// One generated favicon file.
#[derive(Debug, Clone)]
pub struct FaviconFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Favicon files plus the tags referencing them from `<head>`.
#[derive(Debug, Clone, Default)]
pub struct Favicons {
    pub files: Vec<FaviconFile>,
    pub html: Vec<String>,
}

#[async_trait]
pub trait FaviconGenerator: Send + Sync {
    /// `oneOff` builds want the full icon set, `watch` builds only favicons.
    async fn generate(
        &self,
        icon: &Utf8Path,
        metadata: &HtmlMetadata,
        build: BuildName,
    ) -> anyhow::Result<Favicons>;
}

/// Where the shell of one game comes from and goes to.
#[derive(Debug, Clone, Copy)]
pub struct Shell<'a> {
    pub build: BuildName,
    pub icon: &'a Utf8Path,
    /// Directory receiving `index.html` and the favicons.
    pub destination: &'a Utf8Path,
    /// Everything after `<head>`.
    pub body: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Regeneration {
    Skipped,
    Regenerated {
        favicons: Vec<Utf8PathBuf>,
        html: Utf8PathBuf,
    },
}

/// Whether the shell is stale, given the paths created or modified in this
/// build.
pub fn needs_regeneration(
    changed: &HashSet<Utf8PathBuf>,
    icon: &Utf8Path,
    old: &HtmlMetadata,
    new: &HtmlMetadata,
) -> bool {
    changed.contains(icon)
        || new.title != old.title
        || new.description != old.description
        || new.developer.name != old.developer.name
        || new.developer.url != old.developer.url
}

/// Rewrites the favicons and `index.html` of a game when they are stale.
pub async fn regenerate(
    changed: &HashSet<Utf8PathBuf>,
    shell: Shell<'_>,
    old: &HtmlMetadata,
    new: &HtmlMetadata,
    generator: &dyn FaviconGenerator,
) -> Result<Regeneration, RegenerateError> {
    if !needs_regeneration(changed, shell.icon, old, new) {
        tracing::info!("Skipped regeneration of HTML.");
        return Ok(Regeneration::Skipped);
    }

    tracing::info!("Generating favicons...");
    let response = generator
        .generate(shell.icon, new, shell.build)
        .await
        .map_err(RegenerateError::Favicons)?;

    fs::create_dir_all(shell.destination)
        .await
        .map_err(|source| WriteError::CreateDir {
            path: shell.destination.to_owned(),
            source,
        })?;

    let total = response.files.len();
    let mut handles = Vec::with_capacity(total);

    for FaviconFile { name, contents } in response.files {
        let path = shell.destination.join(&name);
        tracing::debug!("Writing favicon file \"{name}\"...");

        let task = async move {
            fs::write(&path, contents)
                .await
                .map_err(|source| WriteError::Write {
                    path: path.clone(),
                    source,
                })?;
            Ok::<_, WriteError>(path)
        };

        handles.push((name, tokio::spawn(task)));
    }

    // Every write is awaited, even after one failed, so none of them is
    // still running once this returns.
    let mut favicons = Vec::with_capacity(total);
    let mut failure = None;
    for (i, (name, handle)) in handles.into_iter().enumerate() {
        match handle.await.map_err(RegenerateError::from) {
            Ok(Ok(path)) => {
                favicons.push(path);
                tracing::info!("Written favicon file \"{name}\" (written {}/{total}).", i + 1);
            }
            Ok(Err(e)) => {
                tracing::error!("Failed to write favicon file \"{name}\": {e}");
                failure.get_or_insert(RegenerateError::from(e));
            }
            Err(e) => {
                tracing::error!("Failed to write favicon file \"{name}\": {e}");
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    let mut html = render(new, &response.html, shell.body);
    if shell.build == BuildName::OneOff {
        html = minify(&html);
    }

    let path = shell.destination.join("index.html");
    tracing::info!("Writing \"{path}\"...");
    fs::write(&path, html)
        .await
        .map_err(|source| WriteError::Write {
            path: path.clone(),
            source,
        })?;

    Ok(Regeneration::Regenerated {
        favicons,
        html: path,
    })
}

fn render(metadata: &HtmlMetadata, head: &[String], body: &str) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>
<html>
  <head>
    <meta charset=\"UTF-8\">
    <title>{}</title>
    <meta name=\"viewport\" content=\"initial-scale=1, minimum-scale=1, maximum-scale=1, width=device-width, height=device-height, user-scalable=no\">
    {}
  </head>
  {}
</html>",
        escape(&metadata.title),
        head.concat(),
        body
    );
    html
}

fn escape(text: &str) -> String {
    let mut acc = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => acc.push_str("&amp;"),
            '<' => acc.push_str("&lt;"),
            '>' => acc.push_str("&gt;"),
            '"' => acc.push_str("&quot;"),
            c => acc.push(c),
        }
    }
    acc
}

/// Elements whose content is copied as is.
const RAW_TEXT: &[&str] = &["script", "style", "pre", "textarea"];

/// Drops whitespace between tags and collapses every other run of
/// whitespace to a single space, except inside [`RAW_TEXT`] elements.
fn minify(html: &str) -> String {
    let mut acc = String::with_capacity(html.len());
    let mut pending = false;
    let mut rest = html;

    while let Some(c) = rest.chars().next() {
        if c == '<'
            && let Some(len) = raw_element(rest)
        {
            acc.push_str(&rest[..len]);
            rest = &rest[len..];
            pending = false;
            continue;
        }
        rest = &rest[c.len_utf8()..];

        if c.is_whitespace() {
            pending = true;
            continue;
        }

        if pending && c != '<' && !acc.is_empty() && !acc.ends_with('>') {
            acc.push(' ');
        }
        pending = false;
        acc.push(c);
    }

    acc
}

/// Length of the raw text element `html` starts with, closing tag included.
fn raw_element(html: &str) -> Option<usize> {
    let name = RAW_TEXT.iter().find(|name| {
        html.get(1..=name.len())
            .is_some_and(|tag| tag.eq_ignore_ascii_case(name))
            && html
                .get(name.len() + 1..)
                .is_some_and(|after| after.starts_with(['>', ' ', '\t', '\n', '\r']))
    })?;

    // ASCII lowercasing keeps byte offsets intact.
    let lower = html.to_ascii_lowercase();
    let close = lower.find(&format!("</{name}"))?;
    let end = close + lower[close..].find('>')? + 1;
    Some(end)
}

/// Favicons rendered from a raster icon.
#[cfg(feature = "favicon")]
pub struct RasterFavicons;

#[cfg(feature = "favicon")]
const FAVICON_SIZES: &[u32] = &[16, 32, 48];

#[cfg(feature = "favicon")]
const FULL_SET: &[(&str, u32, &str)] = &[
    ("apple-touch-icon.png", 180, "apple-touch-icon"),
    ("android-chrome-192x192.png", 192, "icon"),
    ("android-chrome-512x512.png", 512, "icon"),
];

#[cfg(feature = "favicon")]
#[async_trait]
impl FaviconGenerator for RasterFavicons {
    async fn generate(
        &self,
        icon: &Utf8Path,
        _: &HtmlMetadata,
        build: BuildName,
    ) -> anyhow::Result<Favicons> {
        let buffer = fs::read(icon).await?;
        tokio::task::spawn_blocking(move || rasterize(&buffer, build)).await?
    }
}

#[cfg(feature = "favicon")]
fn rasterize(buffer: &[u8], build: BuildName) -> anyhow::Result<Favicons> {
    use image::imageops::FilterType;
    use image::{DynamicImage, ExtendedColorType, ImageEncoder};

    fn encode_png(img: &DynamicImage, size: u32) -> anyhow::Result<Vec<u8>> {
        let rgba = img.resize_exact(size, size, FilterType::Lanczos3).to_rgba8();
        let mut out = Vec::new();
        image::codecs::png::PngEncoder::new(&mut out).write_image(
            &rgba,
            size,
            size,
            ExtendedColorType::Rgba8,
        )?;
        Ok(out)
    }

    let img = image::load_from_memory(buffer)?;
    let mut favicons = Favicons::default();

    for &size in FAVICON_SIZES {
        let name = format!("favicon-{size}x{size}.png");
        favicons.html.push(format!(
            "<link rel=\"icon\" type=\"image/png\" sizes=\"{size}x{size}\" href=\"{name}\">"
        ));
        favicons.files.push(FaviconFile {
            name,
            contents: encode_png(&img, size)?,
        });
    }

    let rgba = img.resize_exact(32, 32, FilterType::Lanczos3).to_rgba8();
    let mut ico = Vec::new();
    image::codecs::ico::IcoEncoder::new(&mut ico).write_image(&rgba, 32, 32, ExtendedColorType::Rgba8)?;
    favicons.files.push(FaviconFile {
        name: "favicon.ico".into(),
        contents: ico,
    });
    favicons
        .html
        .push("<link rel=\"shortcut icon\" href=\"favicon.ico\">".into());

    if build == BuildName::OneOff {
        for &(name, size, rel) in FULL_SET {
            favicons.html.push(format!(
                "<link rel=\"{rel}\" sizes=\"{size}x{size}\" href=\"{name}\">"
            ));
            favicons.files.push(FaviconFile {
                name: name.into(),
                contents: encode_png(&img, size)?,
            });
        }
    }

    Ok(favicons)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FaviconGenerator for Counting {
        async fn generate(
            &self,
            _: &Utf8Path,
            _: &HtmlMetadata,
            build: BuildName,
        ) -> anyhow::Result<Favicons> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let mut files = vec![FaviconFile {
                name: "favicon.ico".into(),
                contents: vec![0, 0, 1, 0],
            }];
            if build == BuildName::OneOff {
                files.push(FaviconFile {
                    name: "apple-touch-icon.png".into(),
                    contents: vec![0x89, b'P', b'N', b'G'],
                });
            }

            Ok(Favicons {
                files,
                html: vec!["<link rel=\"icon\" href=\"favicon.ico\">".into()],
            })
        }
    }

    fn metadata() -> HtmlMetadata {
        HtmlMetadata {
            title: "Pong".into(),
            description: "Two paddles and a ball.".into(),
            developer: Developer {
                name: "Ada".into(),
                url: "https://example.com".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_skips_when_nothing_changed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let generator = Counting::default();

        let shell = Shell {
            build: BuildName::OneOff,
            icon: &root.join("src/pong/icon.png"),
            destination: &root.join("dist"),
            body: "<body></body>",
        };
        let changed = HashSet::from([root.join("src/pong/sprites/ball.svg")]);

        let result = regenerate(&changed, shell, &metadata(), &metadata(), &generator)
            .await
            .unwrap();

        assert_eq!(result, Regeneration::Skipped);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(!root.join("dist").exists());
    }

    #[test]
    fn test_any_metadata_field_triggers() {
        let icon = Utf8Path::new("icon.png");
        let none = HashSet::new();
        let old = metadata();

        let mut new = metadata();
        new.developer.url = "https://example.org".into();
        assert!(needs_regeneration(&none, icon, &old, &new));

        let mut new = metadata();
        new.description.push('!');
        assert!(needs_regeneration(&none, icon, &old, &new));

        assert!(needs_regeneration(
            &HashSet::from([icon.to_owned()]),
            icon,
            &old,
            &old
        ));
        assert!(!needs_regeneration(&none, icon, &old, &old));
    }

    #[tokio::test]
    async fn test_title_change_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let generator = Counting::default();
        let destination = root.join("dist/oneOff/pong");

        let shell = Shell {
            build: BuildName::OneOff,
            icon: &root.join("src/pong/icon.png"),
            destination: &destination,
            body: "<body>\n    <canvas></canvas>\n  </body>",
        };

        let mut new = metadata();
        new.title = "Pong <Deluxe>".into();

        let result = regenerate(&HashSet::new(), shell, &metadata(), &new, &generator)
            .await
            .unwrap();

        let Regeneration::Regenerated { favicons, html } = result else {
            panic!("expected regeneration");
        };
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            favicons,
            vec![
                destination.join("favicon.ico"),
                destination.join("apple-touch-icon.png")
            ]
        );
        assert!(favicons.iter().all(|path| path.exists()));

        let text = std::fs::read_to_string(html).unwrap();
        assert!(text.starts_with("<!DOCTYPE html><html><head>"));
        assert!(text.contains("<title>Pong &lt;Deluxe&gt;</title>"));
        assert!(text.contains("<link rel=\"icon\" href=\"favicon.ico\">"));
        assert!(text.contains("<body><canvas></canvas></body>"));
    }

    #[tokio::test]
    async fn test_watch_build_is_not_minified() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let icon = root.join("src/pong/icon.png");
        let generator = Counting::default();

        let shell = Shell {
            build: BuildName::Watch,
            icon: &icon,
            destination: root,
            body: "<body></body>",
        };

        let result = regenerate(
            &HashSet::from([icon.clone()]),
            shell,
            &metadata(),
            &metadata(),
            &generator,
        )
        .await
        .unwrap();

        let Regeneration::Regenerated { favicons, html } = result else {
            panic!("expected regeneration");
        };
        assert_eq!(favicons.len(), 1);
        assert!(std::fs::read_to_string(html).unwrap().contains("\n  <head>"));
    }

    #[test]
    fn test_minify() {
        assert_eq!(
            minify("<p>\n  hello   world\n</p>\n<br>"),
            "<p>hello world</p><br>"
        );
    }

    #[test]
    fn test_minify_keeps_raw_text() {
        assert_eq!(
            minify(
                "<body>\n  <script>let a = 1\nlet b = 2</script>\n  <PRE> x\n  y </PRE>\n</body>"
            ),
            "<body><script>let a = 1\nlet b = 2</script><PRE> x\n  y </PRE></body>"
        );
        assert_eq!(minify("<prefix>\n a  b </prefix>"), "<prefix>a b</prefix>");
    }

    struct Unwritable;

    #[async_trait]
    impl FaviconGenerator for Unwritable {
        async fn generate(
            &self,
            _: &Utf8Path,
            _: &HtmlMetadata,
            _: BuildName,
        ) -> anyhow::Result<Favicons> {
            let file = |name: &str| FaviconFile {
                name: name.into(),
                contents: vec![1, 2, 3],
            };

            Ok(Favicons {
                files: vec![
                    file("missing/favicon.ico"),
                    file("favicon-16x16.png"),
                    file("favicon-32x32.png"),
                ],
                html: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_failed_favicon_write_waits_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let icon = root.join("icon.png");

        let shell = Shell {
            build: BuildName::Watch,
            icon: &icon,
            destination: root,
            body: "<body></body>",
        };

        let changed = HashSet::from([icon.clone()]);
        let err = regenerate(&changed, shell, &metadata(), &metadata(), &Unwritable)
            .await
            .unwrap_err();

        assert!(matches!(err, RegenerateError::Write(WriteError::Write { .. })));
        assert!(root.join("favicon-16x16.png").exists());
        assert!(root.join("favicon-32x32.png").exists());
        assert!(!root.join("index.html").exists());
    }

    #[cfg(feature = "favicon")]
    #[tokio::test]
    async fn test_raster_favicons() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let icon = root.join("icon.png");

        let img = image::RgbaImage::from_pixel(64, 64, image::Rgba([255, 0, 0, 255]));
        img.save(&icon).unwrap();

        let watch = RasterFavicons
            .generate(&icon, &metadata(), BuildName::Watch)
            .await
            .unwrap();
        assert_eq!(watch.files.len(), FAVICON_SIZES.len() + 1);
        assert_eq!(watch.files.len(), watch.html.len());

        let full = RasterFavicons
            .generate(&icon, &metadata(), BuildName::OneOff)
            .await
            .unwrap();
        assert_eq!(full.files.len(), watch.files.len() + FULL_SET.len());

        let decoded = image::load_from_memory(&full.files[0].contents).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }
}
