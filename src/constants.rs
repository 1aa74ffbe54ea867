/// Content markers wrapped around assembled messages so reduction strategies can find them.
pub const CODE_CELL_MARKER: &str = "JupyterCodeCell";
pub const CODE_CELL_PROBLEMS_MARKER: &str = "JupyterCodeCellProblems";
pub const CODE_CELL_OUTPUT_MARKER: &str = "JupyterCodeCellOutput";

pub const DEFAULT_SYSTEM_MESSAGE: &str = "Format your answer as markdown. If you include a markdown code block, specify the language. All the functions or tools you can call are operating within the context of the workspace the notebook lives in.";

pub const TOOL_CALL_DECLINED: &str = "The user declined the execution of this tool call";

/// Few-shot repair prompt for tool-call arguments that did not concatenate into JSON.
pub const JSON_REPAIR_MODEL: &str = "gpt-4";
pub const JSON_REPAIR_SYSTEM: &str = "You transform every user message into a valid JSON document.";
pub const JSON_REPAIR_EXAMPLE_INPUT: &str = "{include:**/*.*}";
pub const JSON_REPAIR_EXAMPLE_OUTPUT: &str = r#"{"include":"**/*.*"}"#;

/// OpenAI endpoints
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Strategy labels, in the order the strategies are applied.
pub const REMOVE_OUTPUT: &str = "Remove all code cell output";
pub const REMOVE_PROBLEMS: &str = "Remove all code cell problems";
pub const REMOVE_CODE_CELLS: &str = "Remove all code cells";
pub const REMOVE_SYSTEM_MSG: &str = "Remove system message";
pub const TABIFY_WHITESPACE: &str = "Replace 4 spaces with tabs";

/// Progress and notification text
pub const GEN_NEXT_CELL: &str = "Generating next cell(s)...";
pub const COMP_COMPLETED: &str = "Cell generation completed";
pub const COMP_CANCELLED: &str = "Generation cancelled";
pub const COMP_FAILED: &str = "Failed to generate new cell(s)";
pub const API_VIOLATION: &str = "The API finished early due to content policy violation";
pub const SENDING_REQUEST: &str = "Sending ChatCompletion request";
pub const RECEIVING_TOKENS: &str = "Receiving tokens...";
pub const CALCULATING_TOKENS: &str = "Calculating tokens...";
pub const CALCULATING_REDUCTIONS: &str = "Token limit reached. Calculating potential reductions...";
pub const NOT_ENOUGH_SAVINGS: &str = "The selected strategies do not reduce tokens below the limit.";
pub const TOKENIZER_UNAVAILABLE: &str = "Error while counting tokens - skipping token limit checks";
pub const CONTEXT_WINDOW_UNKNOWN: &str = "Unknown context window for this model - skipping token limit checks";
pub const TOOL_CALLS_REQUESTED: &str = "The model requested a local function execution";

/// Error hints by provider status / failure class
pub const HINT_CONNECTION_RESET: &str = "The API closed the connection (ECONNRESET). You can incite the model to finish where it left off by adding a markdown cell with 'continue' and sending a new request.";
pub const HINT_MAX_TOKEN_LIMIT: &str = "The API may return this error when the request goes over the max token limit.";
pub const HINT_API_KEY_ORG: &str = "Ensure the correct API key and requesting organization are being used.";
pub const HINT_ENDPOINT_MODEL: &str = "The endpoint is not found or the requested model is unknown or not available to your account.";
pub const HINT_RATE_LIMIT: &str = "Rate limit reached for requests, or you exceeded your current quota or the engine is currently overloaded.";
pub const HINT_SERVER_ERROR: &str = "The server had an error while processing your request.";
pub const UNHANDLED_FINISH_REASON: &str = "Invalid state: finish_reason wasn't handled.";
