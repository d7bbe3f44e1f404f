pub const VIEWER_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Vein Scanner</title>
  <style>
    body { background-color: #111; margin: 0; text-align: center; }
    img { width: 90%; margin-top: 2vh; image-rendering: auto; }
  </style>
</head>
<body>
  <img src="/video_feed" alt="Live vein scan" />
</body>
</html>
"#;
