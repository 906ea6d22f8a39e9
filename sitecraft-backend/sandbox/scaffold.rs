//! Application skeleton written into a fresh session and the shell command
//! lines used to install dependencies and run the dev server.

use super::paths::shell_quote;

/// File that marks a session whose runtime has been set up.
pub const RUNTIME_MARKER: &str = "package.json";

/// Per-session state kept next to the application, relative to the
/// working directory. Never listed as an application file.
pub const STATE_DIR: &str = ".sitecraft";

/// Log file the background dev server writes to.
pub const DEV_SERVER_LOG: &str = ".sitecraft/dev-server.log";

/// Pid of the dev server started for this session.
pub const DEV_SERVER_PID: &str = ".sitecraft/dev-server.pid";

/// Dev-server port assigned to a local session.
pub const PORT_FILE: &str = ".sitecraft/port";

/// Packages the skeleton already depends on. Imports of these never trigger
/// an install.
pub const PREINSTALLED_PACKAGES: &[&str] = &[
    "react",
    "react-dom",
    "vite",
    "@vitejs/plugin-react",
    "tailwindcss",
    "postcss",
    "autoprefixer",
];

/// Config files owned by the skeleton. Generated copies are not applied.
pub const SCAFFOLD_CONFIG_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "vite.config.js",
    "vite.config.ts",
    "tailwind.config.js",
    "postcss.config.js",
];

pub struct ScaffoldFile {
    pub path: &'static str,
    pub content: String,
}

/// The skeleton files for a React + Vite + Tailwind application serving on
/// `port`.
pub fn skeleton_files(port: u16) -> Vec<ScaffoldFile> {
    vec![
        ScaffoldFile {
            path: "package.json",
            content: r#"{
  "name": "sandbox-app",
  "version": "1.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite",
    "build": "vite build",
    "preview": "vite preview"
  },
  "dependencies": {
    "react": "^18.2.0",
    "react-dom": "^18.2.0"
  },
  "devDependencies": {
    "@vitejs/plugin-react": "^4.0.0",
    "vite": "^4.3.9",
    "tailwindcss": "^3.3.0",
    "postcss": "^8.4.31",
    "autoprefixer": "^10.4.16"
  }
}
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "vite.config.js",
            content: format!(
                r#"import {{ defineConfig }} from 'vite'
import react from '@vitejs/plugin-react'

export default defineConfig({{
  plugins: [react()],
  server: {{
    host: '0.0.0.0',
    port: {port},
    strictPort: true,
    hmr: false,
    allowedHosts: true
  }}
}})
"#
            ),
        },
        ScaffoldFile {
            path: "tailwind.config.js",
            content: r#"/** @type {import('tailwindcss').Config} */
export default {
  content: ["./index.html", "./src/**/*.{js,ts,jsx,tsx}"],
  theme: { extend: {} },
  plugins: [],
}
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "postcss.config.js",
            content: r#"export default {
  plugins: {
    tailwindcss: {},
    autoprefixer: {},
  },
}
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "index.html",
            content: r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Sandbox App</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.jsx"></script>
  </body>
</html>
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "src/main.jsx",
            content: r#"import React from 'react'
import ReactDOM from 'react-dom/client'
import App from './App.jsx'
import './index.css'

ReactDOM.createRoot(document.getElementById('root')).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>,
)
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "src/App.jsx",
            content: r#"function App() {
  return (
    <div className="min-h-screen bg-gray-900 text-white flex items-center justify-center p-4">
      <p className="text-lg text-gray-400">Sandbox ready. Start building.</p>
    </div>
  )
}

export default App
"#
            .to_string(),
        },
        ScaffoldFile {
            path: "src/index.css",
            content: "@tailwind base;\n@tailwind components;\n@tailwind utilities;\n".to_string(),
        },
    ]
}

/// `npm install` for the given packages, or for package.json when empty.
pub fn install_command(packages: &[String]) -> String {
    if packages.is_empty() {
        return "npm install --legacy-peer-deps".to_string();
    }
    let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
    format!("npm install --legacy-peer-deps {}", quoted.join(" "))
}

/// Stop the dev server this session started, found through its pid file.
/// Succeeds when none is running. Run from the working directory.
pub fn kill_dev_server_command() -> String {
    format!(
        "if [ -f {DEV_SERVER_PID} ]; then kill \"$(cat {DEV_SERVER_PID})\" 2>/dev/null; rm -f {DEV_SERVER_PID}; fi; true"
    )
}

/// Launch the dev server detached from the calling shell and record its pid.
/// Vite is started directly so the recorded pid is the server itself.
pub fn start_dev_server_command(port: u16) -> String {
    format!(
        "mkdir -p {STATE_DIR}; nohup ./node_modules/.bin/vite --host 0.0.0.0 --port {port} --strictPort > {DEV_SERVER_LOG} 2>&1 & echo $! > {DEV_SERVER_PID}"
    )
}

/// Copy a prebuilt template into the working directory. Exits non-zero when
/// the template is absent.
pub fn copy_template_command(template_dir: &str, working_directory: &str) -> String {
    let source = format!("{}/.", template_dir.trim_end_matches('/'));
    format!(
        "test -d {} && cp -a {} {}",
        shell_quote(template_dir),
        shell_quote(&source),
        shell_quote(working_directory)
    )
}

pub fn is_scaffold_config(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    SCAFFOLD_CONFIG_FILES.contains(&name)
}
