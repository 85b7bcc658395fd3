use std::time::Duration;
use url::Url;

/// Bounded concurrency guard reused by `BodyFetcher` and any other
/// in-process caller that needs a semaphore-backed cap without threading a
/// raw `Semaphore` through its API.
pub struct ConnectionPool {
    max_connections: usize,
    active_connections: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    semaphore: tokio::sync::Semaphore,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active_connections: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            semaphore: tokio::sync::Semaphore::new(max_connections),
        }
    }

    pub async fn acquire(&self) -> Result<ConnectionGuard<'_>, tokio::sync::AcquireError> {
        let permit = self.semaphore.acquire().await?;
        self.active_connections
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        Ok(ConnectionGuard {
            _permit: permit,
            active_connections: self.active_connections.clone(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active_connections.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn available_count(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

pub struct ConnectionGuard<'a> {
    _permit: tokio::sync::SemaphorePermit<'a>,
    active_connections: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl<'a> Drop for ConnectionGuard<'a> {
    fn drop(&mut self) {
        self.active_connections
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn validate_url(url: &str) -> Result<Url, url::ParseError> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(url::ParseError::InvalidPort),
    }
}

pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.domain().map(|d| d.to_string()))
}

pub fn is_same_domain(url1: &str, url2: &str) -> bool {
    match (extract_domain(url1), extract_domain(url2)) {
        (Some(domain1), Some(domain2)) => domain1 == domain2,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("invalid-url").is_err());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://example.com/path"), Some("example.com".to_string()));
        assert_eq!(
            extract_domain("http://subdomain.example.com"),
            Some("subdomain.example.com".to_string())
        );
        assert_eq!(extract_domain("invalid-url"), None);
    }

    #[test]
    fn test_is_same_domain() {
        assert!(is_same_domain("https://example.com/path1", "https://example.com/path2"));
        assert!(!is_same_domain("https://example.com", "https://other.com"));
        assert!(!is_same_domain("invalid-url", "https://example.com"));
    }

    #[tokio::test]
    async fn connection_pool_tracks_active_count() {
        let pool = ConnectionPool::new(2);
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 1);
        drop(guard);
        assert_eq!(pool.active_count(), 0);
    }
}
