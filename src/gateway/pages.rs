//! HTML for the portal surface
//!
//! Everything interpolated into a page goes through [`escape_html`].

use crate::session::SessionView;

const STYLE: &str = "\
*{margin:0;padding:0;box-sizing:border-box}\
body{font-family:system-ui,sans-serif;background:#eef1f6;display:flex;justify-content:center;align-items:center;min-height:100vh;padding:20px}\
.card{background:#fff;padding:36px;border-radius:10px;box-shadow:0 8px 24px rgba(0,0,0,.15);max-width:420px;width:100%}\
h1{color:#222;margin-bottom:8px;text-align:center}\
p{color:#555;text-align:center;margin-bottom:20px}\
label{display:block;color:#444;margin-bottom:4px}\
input{width:100%;padding:10px;margin-bottom:16px;border:1px solid #ccc;border-radius:5px}\
button{width:100%;padding:11px;background:#3b5bdb;color:#fff;border:0;border-radius:5px;font-size:15px;cursor:pointer}\
.notice{padding:10px;margin-bottom:18px;border-radius:5px;text-align:center}\
.error{background:#fdecea;color:#b42318}\
.info{background:#e7f5ff;color:#1864ab}\
dl{margin:16px 0;color:#333}dt{font-weight:600}dd{margin:0 0 8px}";

/// Message shown above the login form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice<'a> {
    Error(&'a str),
    Info(&'a str),
}

/// Escape text for use in HTML element content and quoted attributes
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n<div class=\"card\">\n{body}\n</div>\n</body>\n</html>\n",
        escape_html(title)
    )
}

/// Login form, optionally with a notice
#[must_use]
pub fn login_page(notice: Option<Notice<'_>>) -> String {
    let notice = match notice {
        Some(Notice::Error(msg)) => format!("<div class=\"notice error\">{}</div>\n", escape_html(msg)),
        Some(Notice::Info(msg)) => format!("<div class=\"notice info\">{}</div>\n", escape_html(msg)),
        None => String::new(),
    };
    document(
        "Network login",
        &format!(
            "<h1>Network login</h1>\n<p>Sign in to access the network</p>\n{notice}\
             <form method=\"POST\" action=\"/login\">\n\
             <label for=\"username\">Username</label>\n\
             <input type=\"text\" id=\"username\" name=\"username\" autocomplete=\"username\" required autofocus>\n\
             <label for=\"password\">Password</label>\n\
             <input type=\"password\" id=\"password\" name=\"password\" autocomplete=\"current-password\" required>\n\
             <button type=\"submit\">Sign in</button>\n</form>"
        ),
    )
}

/// Signed-in page with session details and a logout button
#[must_use]
pub fn status_page(view: &SessionView) -> String {
    document(
        "Access granted",
        &format!(
            "<h1>Access granted</h1>\n<p>Welcome, <strong>{}</strong></p>\n<dl>\n\
             <dt>Address</dt><dd>{}</dd>\n\
             <dt>Signed in</dt><dd>{}</dd>\n\
             <dt>Session ends after</dt><dd>{} minutes of inactivity</dd>\n</dl>\n\
             <form method=\"POST\" action=\"/logout\">\n<button type=\"submit\">Sign out</button>\n</form>",
            escape_html(&view.principal),
            view.identity,
            view.logged_in_at.format("%Y-%m-%d %H:%M:%S UTC"),
            view.expires_in_secs.div_ceil(60),
        ),
    )
}

/// Placeholder served to signed-in clients for non-portal paths
#[must_use]
pub fn granted_page() -> String {
    document(
        "Internet access granted",
        "<h1>Internet access granted</h1>\n<p>You are signed in. <a href=\"/\">Session details</a></p>",
    )
}

/// Generic error page; never echoes request content
#[must_use]
pub fn error_page(code: u16, reason: &str) -> String {
    document(
        reason,
        &format!(
            "<h1>{code} {}</h1>\n<p>The request could not be processed. <a href=\"/\">Return to the portal</a></p>",
            escape_html(reason)
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<script>alert("x") & 'y'</script>"#),
            "&lt;script&gt;alert(&quot;x&quot;) &amp; &#x27;y&#x27;&lt;/script&gt;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_login_page_notice() {
        let page = login_page(Some(Notice::Error("Invalid username or password")));
        assert!(page.contains("notice error"));
        assert!(page.contains("Invalid username or password"));
        assert!(page.contains("action=\"/login\""));

        assert!(!login_page(None).contains("class=\"notice"));
    }

    #[test]
    fn test_status_page_escapes_principal() {
        let view = SessionView {
            identity: "10.0.0.5".parse().unwrap(),
            corroborator: None,
            principal: "<b>mallory</b>".into(),
            logged_in_at: chrono::Utc::now(),
            idle_secs: 0,
            expires_in_secs: 3600,
        };
        let page = status_page(&view);
        assert!(page.contains("&lt;b&gt;mallory&lt;/b&gt;"));
        assert!(page.contains("60 minutes"));
        assert!(page.contains("action=\"/logout\""));
    }

    #[test]
    fn test_error_page() {
        let page = error_page(400, "Bad Request");
        assert!(page.contains("400 Bad Request"));
    }
}
